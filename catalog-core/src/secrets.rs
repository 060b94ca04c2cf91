//! Credential lookup for private repositories.
//!
//! Credentials are opaque to the reconciler: it asks [`SecretLookup`] for
//! the bundle a descriptor references and hands it to the fetch clients.
//! [`FileSecrets`] reads them from
//! `<home>/.catalog/secrets/<namespace>/<name>.yaml`.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, StoreError};
use crate::registry::{catalog_root, validate_name};
use crate::types::{Namespace, RepoSpec};

/// A credential bundle. Secret material is redacted from `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    /// PEM-encoded private key for ssh git remotes.
    pub ssh_private_key: Option<String>,
}

impl Credentials {
    /// Username/password pair when both are present.
    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field(
                "ssh_private_key",
                &self.ssh_private_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Resolves the credentials a descriptor references.
pub trait SecretLookup: Send + Sync {
    /// `Ok(None)` when the descriptor references no secret; an error when
    /// it references one that cannot be read.
    fn get_secret(
        &self,
        namespace: &Namespace,
        spec: &RepoSpec,
    ) -> Result<Option<Credentials>, StoreError>;
}

/// Filesystem-backed [`SecretLookup`].
#[derive(Debug, Clone)]
pub struct FileSecrets {
    root: PathBuf,
    default_namespace: String,
}

impl FileSecrets {
    pub fn new(root: impl Into<PathBuf>, default_namespace: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            default_namespace: default_namespace.into(),
        }
    }

    /// Secrets rooted at `<home>/.catalog/secrets`; cluster-scoped
    /// repositories without an explicit secret namespace use
    /// `default_namespace`.
    pub fn at(home: &Path, default_namespace: impl Into<String>) -> Self {
        Self::new(catalog_root(home).join("secrets"), default_namespace)
    }

    pub fn secret_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{name}.yaml"))
    }
}

impl SecretLookup for FileSecrets {
    fn get_secret(
        &self,
        namespace: &Namespace,
        spec: &RepoSpec,
    ) -> Result<Option<Credentials>, StoreError> {
        let Some(reference) = spec.client_secret.as_ref() else {
            return Ok(None);
        };
        let secret_ns = match (&reference.namespace, namespace.is_empty()) {
            (Some(ns), _) => ns.clone(),
            (None, false) => namespace.0.clone(),
            (None, true) => self.default_namespace.clone(),
        };
        validate_name(&secret_ns)?;
        validate_name(&reference.name)?;

        let path = self.secret_path(&secret_ns, &reference.name);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::SecretNotFound {
                    namespace: secret_ns,
                    name: reference.name.clone(),
                    path,
                });
            }
            Err(err) => return Err(io_err(&path, err)),
        };
        serde_yaml::from_str(&contents)
            .map(Some)
            .map_err(|source| StoreError::Parse { path, source })
    }
}
