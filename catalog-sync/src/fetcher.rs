//! Source selection and change detection.

use chrono::{DateTime, Utc};

use catalog_core::{
    types::{ClusterRepo, IndexDocument, RepoStatus, SourceLocation},
    SecretLookup,
};

use crate::error::SyncError;
use crate::git::GitProvider;
use crate::http::IndexFetcher;

/// What a fetch produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The descriptor names no source.
    NoSource,
    /// The git commit did not move; only `download_time` was updated.
    Unchanged,
    /// The source was reachable but holds no index.
    Empty,
    /// A document to publish. `commit` is empty for http sources.
    Index {
        document: IndexDocument,
        commit: String,
    },
}

/// Resolves credentials, picks git or http, and decides whether the
/// remote content changed since `status` was recorded.
pub struct SourceFetcher<'a> {
    pub secrets: &'a dyn SecretLookup,
    pub git: &'a dyn GitProvider,
    pub http: &'a dyn IndexFetcher,
    /// Baseline passed to git update checks.
    pub baseline: &'a str,
}

impl SourceFetcher<'_> {
    /// Fetch the index for `repo`, recording url and branch into `status`.
    ///
    /// `status` is the caller's working copy; on error the caller drops it.
    pub fn fetch(
        &self,
        repo: &ClusterRepo,
        status: &mut RepoStatus,
        now: DateTime<Utc>,
    ) -> Result<FetchOutcome, SyncError> {
        let namespace = &repo.metadata.namespace;
        match &repo.spec.source {
            SourceLocation::None => Ok(FetchOutcome::NoSource),

            SourceLocation::Git { url, branch } => {
                let credentials = self.secrets.get_secret(namespace, &repo.spec)?;
                let handle = self.git.open(
                    credentials.as_ref(),
                    namespace,
                    repo.name(),
                    url,
                    &repo.spec.tls,
                )?;

                let commit = if status.index.is_none() {
                    tracing::info!("{}: first clone of {url}@{branch}", repo.name());
                    handle.head(branch)?
                } else {
                    handle.check_update(branch, self.baseline)?
                };
                status.url = url.clone();
                status.branch = branch.clone();

                if status.index.is_some() && commit == status.commit {
                    tracing::debug!("{}: {url}@{branch} unchanged at {commit}", repo.name());
                    status.download_time = Some(now);
                    return Ok(FetchOutcome::Unchanged);
                }

                match handle.build_or_get_index()? {
                    Some(document) => Ok(FetchOutcome::Index { document, commit }),
                    None => Ok(FetchOutcome::Empty),
                }
            }

            SourceLocation::Http { url } => {
                let credentials = self.secrets.get_secret(namespace, &repo.spec)?;
                status.url = url.clone();
                status.branch.clear();
                let document = self.http.download_index(
                    credentials.as_ref(),
                    url,
                    &repo.spec.tls,
                    repo.spec.disable_same_origin_check,
                )?;
                match document {
                    Some(document) => Ok(FetchOutcome::Index {
                        document,
                        commit: String::new(),
                    }),
                    None => Ok(FetchOutcome::Empty),
                }
            }
        }
    }
}
