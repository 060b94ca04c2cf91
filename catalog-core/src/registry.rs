//! Repository descriptor and status registry.
//!
//! # Storage layout
//!
//! ```text
//! ~/.catalog/
//!   repos/
//!     <name>.yaml      (ClusterRepo descriptor, user-owned, mode 0600)
//!   status/
//!     <name>.yaml      (RepoStatus, controller-owned, mode 0600)
//! ```
//!
//! Descriptors and status live in separate directories so that the
//! controller persisting status never looks like a descriptor change to
//! the watcher.
//!
//! # API pattern
//!
//! Every function takes an explicit `home: &Path`; callers derive it once
//! from [`home`]. Tests always pass a `TempDir`.

use std::path::{Path, PathBuf};

use crate::error::{io_err, StoreError};
use crate::types::{ClusterRepo, RepoName, RepoSpec, RepoStatus};

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.catalog`
pub fn catalog_root(home: &Path) -> PathBuf {
    home.join(".catalog")
}

/// `<home>/.catalog/repos/`
pub fn repos_dir_at(home: &Path) -> PathBuf {
    catalog_root(home).join("repos")
}

/// `<home>/.catalog/status/`
pub fn status_dir_at(home: &Path) -> PathBuf {
    catalog_root(home).join("status")
}

/// `<home>/.catalog/repos/<name>.yaml`. Pure, no I/O.
pub fn repo_path_at(home: &Path, name: &RepoName) -> PathBuf {
    repos_dir_at(home).join(format!("{}.yaml", name.0))
}

/// `<home>/.catalog/status/<name>.yaml`. Pure, no I/O.
pub fn status_path_at(home: &Path, name: &RepoName) -> PathBuf {
    status_dir_at(home).join(format!("{}.yaml", name.0))
}

/// Resolve the user's home directory.
pub fn home() -> Result<PathBuf, StoreError> {
    dirs::home_dir().ok_or(StoreError::HomeNotFound)
}

/// Reject names that cannot serve as both a file name and an object name.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason| StoreError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > 253 {
        return Err(invalid("must be at most 253 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(invalid(
            "only lowercase letters, digits, '-' and '.' are allowed",
        ));
    }
    let first = name.chars().next().unwrap_or('-');
    let last = name.chars().last().unwrap_or('-');
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err(invalid("must start and end with a letter or digit"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// 2. Descriptors
// ---------------------------------------------------------------------------

/// Load a descriptor from `<home>/.catalog/repos/<name>.yaml`.
///
/// Returns `StoreError::RepoNotFound` if absent,
/// `StoreError::Parse` (with path + line context) if malformed YAML.
pub fn load_repo_at(home: &Path, name: &RepoName) -> Result<ClusterRepo, StoreError> {
    let path = repo_path_at(home, name);
    if !path.exists() {
        return Err(StoreError::RepoNotFound {
            name: name.0.clone(),
            path,
        });
    }
    read_yaml(&path)
}

/// Every registered descriptor, sorted by name.
pub fn list_repos_at(home: &Path) -> Result<Vec<ClusterRepo>, StoreError> {
    let dir = repos_dir_at(home);
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut entries: Vec<_> = std::fs::read_dir(&dir)
        .map_err(|e| io_err(&dir, e))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut repos = Vec::new();
    for entry in entries {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("yaml") {
            continue;
        }
        repos.push(read_yaml(&path)?);
    }
    Ok(repos)
}

/// Atomically write a descriptor.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_repo_at(home: &Path, repo: &ClusterRepo) -> Result<(), StoreError> {
    validate_name(&repo.metadata.name.0)?;
    if !repo.metadata.namespace.is_empty() {
        validate_name(repo.metadata.namespace.as_str())?;
    }
    let yaml = serde_yaml::to_string(repo)?;
    write_atomic(&repo_path_at(home, &repo.metadata.name), yaml.as_bytes())
}

/// Register a new descriptor. Fails if the name is already taken.
pub fn add_repo_at(home: &Path, repo: &ClusterRepo) -> Result<(), StoreError> {
    if repo_path_at(home, &repo.metadata.name).exists() {
        return Err(StoreError::RepoExists {
            name: repo.metadata.name.0.clone(),
        });
    }
    save_repo_at(home, repo)
}

/// Apply `edit` to a descriptor's spec and bump its generation.
pub fn update_spec_at(
    home: &Path,
    name: &RepoName,
    edit: impl FnOnce(&mut RepoSpec),
) -> Result<ClusterRepo, StoreError> {
    let mut repo = load_repo_at(home, name)?;
    edit(&mut repo.spec);
    repo.metadata.generation += 1;
    save_repo_at(home, &repo)?;
    Ok(repo)
}

/// Delete the descriptor and its status. Returns the removed descriptor.
pub fn remove_repo_at(home: &Path, name: &RepoName) -> Result<ClusterRepo, StoreError> {
    let repo = load_repo_at(home, name)?;
    remove_if_exists(&repo_path_at(home, name))?;
    remove_if_exists(&status_path_at(home, name))?;
    Ok(repo)
}

// ---------------------------------------------------------------------------
// 3. Status
// ---------------------------------------------------------------------------

/// Load the persisted status. A repository that was never reconciled has
/// the default (empty) status.
pub fn load_status_at(home: &Path, name: &RepoName) -> Result<RepoStatus, StoreError> {
    let path = status_path_at(home, name);
    if !path.exists() {
        return Ok(RepoStatus::default());
    }
    read_yaml(&path)
}

/// Atomically persist status.
pub fn save_status_at(home: &Path, name: &RepoName, status: &RepoStatus) -> Result<(), StoreError> {
    validate_name(&name.0)?;
    let yaml = serde_yaml::to_string(status)?;
    write_atomic(&status_path_at(home, name), yaml.as_bytes())
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    serde_yaml::from_str(&contents).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `bytes` to `<path>.tmp` (mode 0600), then rename over `path`.
/// The parent directory is created (mode 0700) when missing.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = tmp_path(path);
    stage(&tmp, bytes)?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        io_err(path, e)
    })
}

/// `<path>.tmp`, always a sibling of the target (same filesystem).
pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write a temp file without renaming it into place.
pub(crate) fn stage(tmp: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(dir) = tmp.parent() {
        ensure_dir(dir)?;
    }
    std::fs::write(tmp, bytes).map_err(|e| io_err(tmp, e))?;
    set_file_permissions(tmp)
}

pub(crate) fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        set_dir_permissions(dir)?;
    }
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(path, err)),
    }
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
