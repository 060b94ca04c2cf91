//! `catalog daemon`: background reconcile loop and its control socket.

use anyhow::{Context, Result};
use clap::Subcommand;

use catalog_daemon::paths::socket_path;
use catalog_daemon::{request_reconcile, request_status, request_stop, start_blocking, DaemonError};
use catalog_sync::Role;

use super::home;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (watcher + workers + socket server).
    Start {
        /// Run the follower path instead of downloading and publishing.
        #[arg(long)]
        follower: bool,
    },
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status,
    /// Ask a running daemon to reconcile one repository, or all of them.
    Reconcile {
        name: Option<String>,
    },
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = home()?;

    match command {
        DaemonCommand::Start { follower } => {
            let role = if follower { Role::Follower } else { Role::Leader };
            start_blocking(&home, role).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => {
            let payload = match request_status(&home) {
                Ok(status) => status,
                Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query daemon status"),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload)
                    .context("failed to render daemon status JSON")?
            );
        }
        DaemonCommand::Reconcile { name } => {
            let queued = request_reconcile(&home, name).context("failed to queue reconcile")?;
            let names: Vec<&str> = queued["queued"]
                .as_array()
                .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
                .unwrap_or_default();
            if names.is_empty() {
                println!("nothing to reconcile");
            } else {
                println!("queued: {}", names.join(", "));
            }
        }
    }

    Ok(())
}
