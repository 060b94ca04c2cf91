//! Shared reconcile entrypoint used by CLI and daemon.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;

use catalog_core::{
    registry,
    types::{ConditionType, RepoName, RepoStatus},
    FileSecrets, FileStore, Settings,
};

use crate::git::CliGit;
use crate::handler::{RepoHandler, Requeue};
use crate::http::HttpFetcher;
use crate::SyncError;

/// Which entry point a replica runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Downloads and publishes the index.
    #[default]
    Leader,
    /// Keeps a local working copy only.
    Follower,
}

impl Role {
    pub fn condition(self) -> ConditionType {
        match self {
            Role::Leader => ConditionType::Downloaded,
            Role::Follower => ConditionType::FollowerDownloaded,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leader" => Ok(Role::Leader),
            "follower" => Ok(Role::Follower),
            other => Err(format!("unknown role `{other}` (expected leader or follower)")),
        }
    }
}

/// Result of one reconcile run.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub name: RepoName,
    pub role: Role,
    pub status: RepoStatus,
    /// Whether the persisted status was rewritten.
    pub changed: bool,
}

/// Handler wired to the filesystem store, file secrets, the `git`
/// executable and `ureq`.
pub fn default_handler(home: &Path, settings: Settings, requeue: Arc<dyn Requeue>) -> RepoHandler {
    let git = CliGit::new(settings.git_cache_dir_at(home));
    let secrets = FileSecrets::at(home, settings.system_namespace.clone());
    RepoHandler::new(
        settings,
        Arc::new(FileStore::at(home)),
        Arc::new(secrets),
        Arc::new(git),
        Arc::new(HttpFetcher::new()),
        requeue,
    )
}

/// Load `name`, run the handler for `role`, record the role's condition and
/// persist the status when it changed. A failed run still records the
/// failed condition before the error is returned.
pub fn reconcile_at(
    home: &Path,
    handler: &RepoHandler,
    name: &RepoName,
    role: Role,
) -> Result<ReconcileOutcome, SyncError> {
    let repo = registry::load_repo_at(home, name)?;
    let previous = registry::load_status_at(home, name)?;
    let now = Utc::now();

    let result = match role {
        Role::Leader => handler.download_status_at(&repo, previous.clone(), now),
        Role::Follower => handler.ensure_status(&repo, previous.clone()),
    };

    match result {
        Ok(mut status) => {
            status.set_condition(role.condition(), true, "", now);
            let changed = status != previous;
            if changed {
                registry::save_status_at(home, name, &status)?;
            }
            Ok(ReconcileOutcome {
                name: name.clone(),
                role,
                status,
                changed,
            })
        }
        Err(err) => {
            let mut status = previous.clone();
            status.set_condition(role.condition(), false, err.to_string(), now);
            if status != previous {
                if let Err(save_err) = registry::save_status_at(home, name, &status) {
                    tracing::warn!("{name}: could not record failure: {save_err}");
                }
            }
            Err(err)
        }
    }
}
