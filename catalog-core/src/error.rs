//! Error types for catalog-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from registry, object store, secret and
/// settings operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load; includes file path and line context from serde_yaml.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.catalog/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// No descriptor exists for the named repository.
    #[error("repository '{name}' not found at {path}")]
    RepoNotFound { name: String, path: PathBuf },

    /// A descriptor with this name is already registered.
    #[error("repository '{name}' already exists")]
    RepoExists { name: String },

    /// Names become file names and object names; reject anything else.
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// A referenced credentials document does not exist.
    #[error("secret {namespace}/{name} not found at {path}")]
    SecretNotFound {
        namespace: String,
        name: String,
        path: PathBuf,
    },
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
