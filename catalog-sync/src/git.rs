//! Git source access.
//!
//! [`GitProvider`] opens a [`GitRepository`] handle scoped to one
//! repository resource and URL. [`CliGit`] implements both on top of the
//! `git` executable with one shallow working copy per (namespace, name, url).

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use base64::Engine as _;
use sha2::{Digest, Sha256};

use catalog_core::{
    types::{ChartVersion, IndexDocument, Namespace, RepoName, TlsPolicy},
    Credentials,
};

use crate::error::{io_err, SyncError};

/// Baseline marker under which update checks never touch the network.
pub const BUNDLED: &str = "bundled";

const INDEX_FILE: &str = "index.yaml";
const CHART_FILE: &str = "Chart.yaml";

/// A local working copy of one remote.
pub trait GitRepository {
    /// Make sure the working copy exists at `branch`, then return the
    /// commit it is on.
    fn head(&self, branch: &str) -> Result<String, SyncError>;

    /// Latest commit of `branch` relative to `baseline`. With the
    /// [`BUNDLED`] baseline an existing checkout is reported as is.
    fn check_update(&self, branch: &str, baseline: &str) -> Result<String, SyncError>;

    /// Clone or fast-forward the working copy to the remote `branch`.
    fn ensure(&self, branch: &str) -> Result<(), SyncError>;

    /// `index.yaml` from the checkout root, or one built from the
    /// `Chart.yaml` files in the tree. `None` when there is neither.
    fn build_or_get_index(&self) -> Result<Option<IndexDocument>, SyncError>;
}

pub trait GitProvider: Send + Sync {
    fn open(
        &self,
        credentials: Option<&Credentials>,
        namespace: &Namespace,
        name: &RepoName,
        url: &str,
        tls: &TlsPolicy,
    ) -> Result<Box<dyn GitRepository>, SyncError>;
}

// ---------------------------------------------------------------------------
// CliGit
// ---------------------------------------------------------------------------

/// [`GitProvider`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct CliGit {
    cache_dir: PathBuf,
}

impl CliGit {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// `<cache>/<namespace or _cluster>/<name>/<sha256(url)[..16]>`
    pub fn checkout_dir(&self, namespace: &Namespace, name: &RepoName, url: &str) -> PathBuf {
        let ns = if namespace.is_empty() {
            "_cluster"
        } else {
            namespace.as_str()
        };
        let digest = hex::encode(Sha256::digest(url.as_bytes()));
        self.cache_dir.join(ns).join(&name.0).join(&digest[..16])
    }

    /// Concrete variant of [`GitProvider::open`].
    pub fn open_repository(
        &self,
        credentials: Option<&Credentials>,
        namespace: &Namespace,
        name: &RepoName,
        url: &str,
        tls: &TlsPolicy,
    ) -> Result<CliGitRepository, SyncError> {
        let dir = self.checkout_dir(namespace, name, url);
        let mut config = Vec::new();
        let mut env = Vec::new();

        if tls.insecure_skip_tls_verify {
            config.push(("http.sslVerify".to_string(), "false".to_string()));
        }
        if let Some(bundle) = tls.ca_bundle.as_deref() {
            let path = sidecar(&dir, "ca.pem");
            write_private(&path, bundle.as_bytes())?;
            config.push(("http.sslCAInfo".to_string(), path.display().to_string()));
        }
        if let Some(creds) = credentials {
            if let Some((user, pass)) = creds.basic_auth() {
                let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
                config.push((
                    "http.extraHeader".to_string(),
                    format!("Authorization: Basic {token}"),
                ));
            }
            if let Some(key) = creds.ssh_private_key.as_deref() {
                let path = sidecar(&dir, "ssh-key");
                write_private(&path, key.as_bytes())?;
                env.push((
                    "GIT_SSH_COMMAND".to_string(),
                    format!(
                        "ssh -i '{}' -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
                        path.display()
                    ),
                ));
            }
        }

        Ok(CliGitRepository {
            dir,
            url: url.to_string(),
            config,
            env,
        })
    }
}

impl GitProvider for CliGit {
    fn open(
        &self,
        credentials: Option<&Credentials>,
        namespace: &Namespace,
        name: &RepoName,
        url: &str,
        tls: &TlsPolicy,
    ) -> Result<Box<dyn GitRepository>, SyncError> {
        Ok(Box::new(self.open_repository(credentials, namespace, name, url, tls)?))
    }
}

/// One working copy driven through the `git` executable.
#[derive(Debug)]
pub struct CliGitRepository {
    dir: PathBuf,
    url: String,
    /// Passed through `GIT_CONFIG_*` so credentials never appear in argv.
    config: Vec<(String, String)>,
    env: Vec<(String, String)>,
}

impl CliGitRepository {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn has_checkout(&self) -> bool {
        self.dir.join(".git").is_dir()
    }

    fn run<I, S>(&self, op: &'static str, in_checkout: bool, args: I) -> Result<String, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("git");
        if in_checkout {
            cmd.arg("-C").arg(&self.dir);
        }
        cmd.args(args).env("GIT_TERMINAL_PROMPT", "0");
        cmd.env("GIT_CONFIG_COUNT", self.config.len().to_string());
        for (i, (key, value)) in self.config.iter().enumerate() {
            cmd.env(format!("GIT_CONFIG_KEY_{i}"), key);
            cmd.env(format!("GIT_CONFIG_VALUE_{i}"), value);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        tracing::debug!("git {op} in {}", self.dir.display());
        let output = cmd.output().map_err(|e| self.git_err(op, format!("cannot run git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(self.git_err(op, stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn git_err(&self, op: &'static str, message: String) -> SyncError {
        SyncError::Git {
            op,
            url: self.url.clone(),
            message,
        }
    }

    fn rev_parse(&self, rev: &str) -> Result<String, SyncError> {
        self.run("rev-parse", true, ["rev-parse", rev])
    }

    fn remote_head(&self, branch: &str) -> Result<String, SyncError> {
        let refname = format!("refs/heads/{branch}");
        let out = self.run("ls-remote", true, ["ls-remote", "origin", refname.as_str()])?;
        out.split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| self.git_err("ls-remote", format!("branch {branch} not found")))
    }

    fn clone_branch(&self, branch: &str) -> Result<(), SyncError> {
        if let Some(parent) = self.dir.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        // A directory without `.git` is a leftover from an interrupted clone.
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        }
        let args: [&OsStr; 10] = [
            "clone".as_ref(),
            "--quiet".as_ref(),
            "--depth".as_ref(),
            "1".as_ref(),
            "--single-branch".as_ref(),
            "--branch".as_ref(),
            branch.as_ref(),
            "--".as_ref(),
            self.url.as_ref(),
            self.dir.as_os_str(),
        ];
        self.run("clone", false, args)?;
        tracing::info!("cloned {}@{} into {}", self.url, branch, self.dir.display());
        Ok(())
    }
}

impl GitRepository for CliGitRepository {
    fn head(&self, branch: &str) -> Result<String, SyncError> {
        self.ensure(branch)?;
        self.rev_parse("HEAD")
    }

    fn check_update(&self, branch: &str, baseline: &str) -> Result<String, SyncError> {
        if baseline == BUNDLED && self.has_checkout() {
            return self.rev_parse("HEAD");
        }
        self.head(branch)
    }

    fn ensure(&self, branch: &str) -> Result<(), SyncError> {
        if !self.has_checkout() {
            return self.clone_branch(branch);
        }

        let remote = self.remote_head(branch)?;
        let local = self.rev_parse("HEAD")?;
        let on_branch = self
            .run("rev-parse", true, ["rev-parse", "--abbrev-ref", "HEAD"])
            .map(|b| b == branch)
            .unwrap_or(false);
        if local == remote && on_branch {
            tracing::debug!("{} already at {}@{}", self.dir.display(), branch, remote);
            return Ok(());
        }

        self.run("fetch", true, ["fetch", "--quiet", "--depth", "1", "origin", branch])?;
        self.run("checkout", true, ["checkout", "--quiet", "--force", "-B", branch, "FETCH_HEAD"])?;
        tracing::info!("updated {} to {}@{}", self.dir.display(), branch, remote);
        Ok(())
    }

    fn build_or_get_index(&self) -> Result<Option<IndexDocument>, SyncError> {
        let index_path = self.dir.join(INDEX_FILE);
        match fs::read(&index_path) {
            Ok(bytes) => {
                let doc = IndexDocument::from_yaml(&bytes).map_err(|source| SyncError::IndexParse {
                    origin: index_path.display().to_string(),
                    source,
                })?;
                return Ok(Some(doc));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&index_path, err)),
        }
        index_from_charts(&self.dir)
    }
}

// ---------------------------------------------------------------------------
// Index from Chart.yaml files
// ---------------------------------------------------------------------------

/// Build an index from every `Chart.yaml` below `root`. Each version's
/// single url is the chart directory relative to `root`.
fn index_from_charts(root: &Path) -> Result<Option<IndexDocument>, SyncError> {
    let mut doc = IndexDocument::default();
    for dir in collect_dirs(root)? {
        let chart_path = dir.join(CHART_FILE);
        let bytes = match fs::read(&chart_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&chart_path, err)),
        };
        let mut version: ChartVersion =
            serde_yaml::from_slice(&bytes).map_err(|source| SyncError::IndexParse {
                origin: chart_path.display().to_string(),
                source,
            })?;
        let relative = dir.strip_prefix(root).unwrap_or(&dir);
        version.urls = vec![relative.to_string_lossy().replace('\\', "/")];
        doc.entries.entry(version.name.clone()).or_default().push(version);
    }

    if doc.is_empty() {
        return Ok(None);
    }
    doc.sort_entries();
    Ok(Some(doc))
}

/// Breadth-first walk of `root`, skipping hidden directories. Directories
/// below a chart (vendored subcharts, templates) are not visited.
fn collect_dirs(root: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut dirs = vec![root.to_path_buf()];
    let mut cursor = 0;
    while cursor < dirs.len() {
        let current = dirs[cursor].clone();
        cursor += 1;
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    continue;
                }
                return Err(io_err(&current, err));
            }
        };
        if current.join(CHART_FILE).is_file() {
            continue;
        }
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if ty.is_dir() && !hidden {
                dirs.push(entry.path());
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sidecar(dir: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}.{suffix}", dir.display()))
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    fs::write(path, bytes).map_err(|e| io_err(path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
