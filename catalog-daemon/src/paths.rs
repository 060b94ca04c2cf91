use std::path::{Path, PathBuf};
use std::time::Duration;

use catalog_core::registry;

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
/// First retry delay after a failed reconcile; doubles per consecutive failure.
pub const RETRY_BASE: Duration = Duration::from_secs(1);
pub const RETRY_MAX: Duration = Duration::from_secs(5 * 60);

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn repos_root(home: &Path) -> PathBuf {
    registry::repos_dir_at(home)
}

pub fn run_dir(home: &Path) -> PathBuf {
    registry::catalog_root(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    run_dir(home).join(DAEMON_SOCKET)
}
