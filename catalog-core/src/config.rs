//! Controller settings.
//!
//! Loaded from `<home>/.catalog/config.yaml`. Every field is optional; a
//! missing file yields [`Settings::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, StoreError};
use crate::registry::catalog_root;

/// Largest number of bytes stored in a single chunk object.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 100_000;
/// Fixed re-check interval for every repository.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 5 * 60;
/// Namespace used for objects of cluster-scoped repositories.
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "catalog-system";
/// Baseline marker passed to git update checks.
pub const DEFAULT_SYSTEM_CATALOG: &str = "external";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub refresh_interval_secs: u64,
    pub max_chunk_size: usize,
    pub system_namespace: String,
    /// `bundled` keeps git update checks offline; anything else fetches.
    pub system_catalog: String,
    /// Upper bound on concurrently running reconciliations in the daemon.
    pub workers: usize,
    /// Where git working copies live. Defaults to `<home>/.catalog/git`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_cache_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            system_catalog: DEFAULT_SYSTEM_CATALOG.to_string(),
            workers: 4,
            git_cache_dir: None,
        }
    }
}

impl Settings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn git_cache_dir_at(&self, home: &Path) -> PathBuf {
        self.git_cache_dir
            .clone()
            .unwrap_or_else(|| catalog_root(home).join("git"))
    }
}

/// `<home>/.catalog/config.yaml`
pub fn settings_path_at(home: &Path) -> PathBuf {
    catalog_root(home).join("config.yaml")
}

/// Load settings, falling back to defaults when the file is absent.
pub fn load_at(home: &Path) -> Result<Settings, StoreError> {
    let path = settings_path_at(home);
    if !path.exists() {
        return Ok(Settings::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let settings: Settings =
        serde_yaml::from_str(&contents).map_err(|source| StoreError::Parse { path, source })?;
    Ok(Settings {
        workers: settings.workers.max(1),
        max_chunk_size: settings.max_chunk_size.max(1),
        ..settings
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_when_file_missing() {
        let home = TempDir::new().unwrap();
        let settings = load_at(home.path()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.refresh_interval(), Duration::from_secs(300));
        assert_eq!(settings.max_chunk_size, 100_000);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let home = TempDir::new().unwrap();
        let path = settings_path_at(home.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "refresh_interval_secs: 60\nworkers: 0\n").unwrap();

        let settings = load_at(home.path()).unwrap();
        assert_eq!(settings.refresh_interval_secs, 60);
        assert_eq!(settings.workers, 1, "zero workers is clamped");
        assert_eq!(settings.system_namespace, DEFAULT_SYSTEM_NAMESPACE);
    }

    #[test]
    fn git_cache_dir_defaults_under_catalog_root() {
        let home = TempDir::new().unwrap();
        let dir = Settings::default().git_cache_dir_at(home.path());
        assert!(dir.ends_with(".catalog/git"));
    }
}
