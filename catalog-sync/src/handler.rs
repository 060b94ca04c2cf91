//! Reconciliation handler: the leader and follower entry points.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use catalog_core::{
    types::{ClusterRepo, RepoName, RepoStatus},
    ObjectStore, SecretLookup, Settings,
};

use crate::chunker;
use crate::error::SyncError;
use crate::fetcher::{FetchOutcome, SourceFetcher};
use crate::git::GitProvider;
use crate::http::IndexFetcher;
use crate::staleness;

/// Re-arms the periodic check for a repository.
pub trait Requeue: Send + Sync {
    fn enqueue_after(&self, name: &RepoName, after: Duration);
}

/// [`Requeue`] for one-shot runs with no scheduler behind them.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRequeue;

impl Requeue for NoRequeue {
    fn enqueue_after(&self, _name: &RepoName, _after: Duration) {}
}

/// Stateless reconciler. Every method takes the descriptor and the last
/// persisted status and returns the status to persist; on error the
/// caller keeps what it had.
pub struct RepoHandler {
    settings: Settings,
    store: Arc<dyn ObjectStore>,
    secrets: Arc<dyn SecretLookup>,
    git: Arc<dyn GitProvider>,
    http: Arc<dyn IndexFetcher>,
    requeue: Arc<dyn Requeue>,
}

impl RepoHandler {
    pub fn new(
        settings: Settings,
        store: Arc<dyn ObjectStore>,
        secrets: Arc<dyn SecretLookup>,
        git: Arc<dyn GitProvider>,
        http: Arc<dyn IndexFetcher>,
        requeue: Arc<dyn Requeue>,
    ) -> Self {
        Self {
            settings,
            store,
            secrets,
            git,
            http,
            requeue,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    /// Leader path: self-check the index, then download and publish when
    /// the staleness policy asks for it.
    pub fn download_status(
        &self,
        repo: &ClusterRepo,
        status: RepoStatus,
    ) -> Result<RepoStatus, SyncError> {
        self.download_status_at(repo, status, Utc::now())
    }

    /// [`Self::download_status`] with an explicit clock.
    pub fn download_status_at(
        &self,
        repo: &ClusterRepo,
        mut status: RepoStatus,
        now: DateTime<Utc>,
    ) -> Result<RepoStatus, SyncError> {
        self.requeue
            .enqueue_after(repo.name(), self.settings.refresh_interval());
        self.ensure_index_object(repo, &mut status)?;

        match staleness::check(&repo.spec, &status, now, self.settings.refresh_interval()) {
            Some(reason) => {
                tracing::info!("{}: refreshing ({reason})", repo.name());
                self.download(repo, status, now)
            }
            None => {
                tracing::debug!("{}: up to date", repo.name());
                Ok(status)
            }
        }
    }

    /// Follower path: keep a local working copy at the branch the leader
    /// last downloaded. Does nothing until the leader has recorded the
    /// declared branch, and never touches the published index.
    pub fn ensure_status(
        &self,
        repo: &ClusterRepo,
        mut status: RepoStatus,
    ) -> Result<RepoStatus, SyncError> {
        self.requeue
            .enqueue_after(repo.name(), self.settings.refresh_interval());

        let Some(branch) = repo.spec.source.branch() else {
            return Ok(status);
        };
        if status.branch.is_empty() || status.branch != branch {
            tracing::debug!(
                "{}: waiting for download of branch {branch} (recorded {:?})",
                repo.name(),
                status.branch
            );
            return Ok(status);
        }

        status.observed_generation = repo.metadata.generation;
        let namespace = &repo.metadata.namespace;
        let credentials = self.secrets.get_secret(namespace, &repo.spec)?;
        let handle = self.git.open(
            credentials.as_ref(),
            namespace,
            repo.name(),
            &status.url,
            &repo.spec.tls,
        )?;
        handle.ensure(branch)?;
        Ok(status)
    }

    /// Clear a recorded chunk-chain root whose object no longer exists, so
    /// the next staleness check sees no index.
    pub fn ensure_index_object(
        &self,
        repo: &ClusterRepo,
        status: &mut RepoStatus,
    ) -> Result<(), SyncError> {
        if !repo.spec.source.is_git() {
            return Ok(());
        }
        let Some(root) = status.index.as_ref() else {
            return Ok(());
        };
        if self.store.get(&root.namespace, &root.name)?.is_none() {
            tracing::warn!(
                "{}: index root {}/{} is gone, clearing",
                repo.name(),
                root.namespace,
                root.name
            );
            status.index = None;
        }
        Ok(())
    }

    fn download(
        &self,
        repo: &ClusterRepo,
        mut status: RepoStatus,
        now: DateTime<Utc>,
    ) -> Result<RepoStatus, SyncError> {
        status.observed_generation = repo.metadata.generation;
        let fetcher = SourceFetcher {
            secrets: self.secrets.as_ref(),
            git: self.git.as_ref(),
            http: self.http.as_ref(),
            baseline: &self.settings.system_catalog,
        };

        match fetcher.fetch(repo, &mut status, now)? {
            FetchOutcome::NoSource => {
                tracing::debug!("{}: no source configured", repo.name());
            }
            FetchOutcome::Unchanged => {}
            FetchOutcome::Empty => {
                tracing::info!("{}: source has no index", repo.name());
            }
            FetchOutcome::Index {
                mut document,
                commit,
            } => {
                let root = chunker::publish(
                    self.store.as_ref(),
                    &repo.metadata.namespace,
                    &repo.owner_reference(),
                    &mut document,
                    &self.settings,
                )?;
                status.index = Some(root);
                status.download_time = Some(now);
                status.commit = commit;
            }
        }
        Ok(status)
    }
}
