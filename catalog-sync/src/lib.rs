//! # catalog-sync
//!
//! Reconciliation core for catalog repositories.
//!
//! [`RepoHandler`] runs the leader path ([`RepoHandler::download_status`])
//! and the follower path ([`RepoHandler::ensure_status`]). The leader asks
//! [`staleness::check`] whether work is needed, fetches through
//! [`SourceFetcher`], and publishes the result as a chunk chain with
//! [`chunker::publish`]. [`pipeline::reconcile_at`] wraps both paths with
//! status persistence for the CLI and the daemon.

pub mod chunker;
pub mod error;
pub mod fetcher;
pub mod git;
pub mod handler;
pub mod http;
pub mod pipeline;
pub mod staleness;

pub use error::SyncError;
pub use fetcher::{FetchOutcome, SourceFetcher};
pub use git::{CliGit, GitProvider, GitRepository};
pub use handler::{NoRequeue, RepoHandler, Requeue};
pub use http::{HttpFetcher, IndexFetcher};
pub use pipeline::{reconcile_at, ReconcileOutcome, Role};
pub use staleness::RefreshReason;
