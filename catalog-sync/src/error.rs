//! Error types for catalog-sync.

use std::path::PathBuf;

use thiserror::Error;

use catalog_core::StoreError;

/// All errors that can arise while reconciling a repository. The scheduler
/// treats every variant as retryable.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An error from the registry, object store or secret lookup.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Index payload encode/decode failure.
    #[error("index JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A remote or checked-out `index.yaml` / `Chart.yaml` did not parse.
    #[error("failed to parse {origin}: {source}")]
    IndexParse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// A git command failed.
    #[error("git {op} failed for {url}: {message}")]
    Git {
        op: &'static str,
        url: String,
        message: String,
    },

    /// The http index download failed.
    #[error("failed to download {url}: {message}")]
    Http { url: String, message: String },

    /// The TLS policy could not be turned into a client configuration.
    #[error("invalid TLS configuration: {0}")]
    Tls(String),

    /// A published chunk chain is not well formed.
    #[error("chunk chain rooted at {root} is broken: {reason}")]
    BrokenChain { root: String, reason: String },
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
