//! Owner-scoped object store.
//!
//! [`ObjectStore`] is the storage boundary the reconciler writes chunk
//! objects through. [`FileStore`] keeps each object as two files:
//!
//! ```text
//! <root>/<namespace>/<name>.yaml   (metadata: owner, annotations, revision)
//! <root>/<namespace>/<name>.bin    (binary content)
//! ```
//!
//! Revisions are content-addressed, so re-applying an identical object
//! keeps its revision and does not touch the files.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{io_err, StoreError};
use crate::registry::{catalog_root, ensure_dir, remove_if_exists, stage, tmp_path, validate_name};
use crate::types::{Namespace, ObjectRef, OwnerReference, Uid};

/// A named binary object with annotations and a single owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub name: String,
    pub namespace: Namespace,
    pub owner: OwnerReference,
    pub annotations: BTreeMap<String, String>,
    pub content: Vec<u8>,
    /// Assigned by the store; ignored on apply.
    pub revision: String,
}

impl StoredObject {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            revision: self.revision.clone(),
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Storage operations the reconciler depends on.
pub trait ObjectStore: Send + Sync {
    /// Fetch an object. A missing object is `Ok(None)`, not an error.
    fn get(&self, namespace: &Namespace, name: &str) -> Result<Option<StoredObject>, StoreError>;

    /// Write `objects` as one owner-scoped set into `namespace`: every
    /// object is created or updated, and objects of the same owner in that
    /// namespace that are not part of the set are deleted. Returns the
    /// identity of each object in input order.
    fn apply_owned(
        &self,
        owner: &OwnerReference,
        namespace: &Namespace,
        objects: Vec<StoredObject>,
    ) -> Result<Vec<ObjectRef>, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ObjectMetadata {
    name: String,
    namespace: Namespace,
    owner: OwnerReference,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    revision: String,
}

/// Filesystem-backed [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at `<home>/.catalog/objects`.
    pub fn at(home: &Path) -> Self {
        Self::new(catalog_root(home).join("objects"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of every object in `namespace` owned by `uid`, sorted.
    pub fn list_owned(&self, namespace: &Namespace, uid: &Uid) -> Result<Vec<String>, StoreError> {
        let dir = self.namespace_dir(namespace);
        let mut names = Vec::new();
        for meta in read_metadata_dir(&dir)? {
            if &meta.owner.uid == uid {
                names.push(meta.name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete every object owned by `uid` in every namespace. This is the
    /// cascade that runs when the owning repository is removed.
    pub fn remove_owned(&self, uid: &Uid) -> Result<usize, StoreError> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        let entries = std::fs::read_dir(&self.root).map_err(|e| io_err(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.root, e))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let dir = entry.path();
            for meta in read_metadata_dir(&dir)? {
                if &meta.owner.uid == uid {
                    self.remove_files(&dir, &meta.name)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn namespace_dir(&self, namespace: &Namespace) -> PathBuf {
        self.root.join(namespace.as_str())
    }

    fn remove_files(&self, dir: &Path, name: &str) -> Result<(), StoreError> {
        remove_if_exists(&dir.join(format!("{name}.yaml")))?;
        remove_if_exists(&dir.join(format!("{name}.bin")))
    }
}

impl ObjectStore for FileStore {
    fn get(&self, namespace: &Namespace, name: &str) -> Result<Option<StoredObject>, StoreError> {
        let dir = self.namespace_dir(namespace);
        let meta_path = dir.join(format!("{name}.yaml"));
        let Some(meta) = read_metadata(&meta_path)? else {
            return Ok(None);
        };
        let content_path = dir.join(format!("{name}.bin"));
        let content = match std::fs::read(&content_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(&content_path, err)),
        };
        Ok(Some(StoredObject {
            name: meta.name,
            namespace: meta.namespace,
            owner: meta.owner,
            annotations: meta.annotations,
            content,
            revision: meta.revision,
        }))
    }

    fn apply_owned(
        &self,
        owner: &OwnerReference,
        namespace: &Namespace,
        objects: Vec<StoredObject>,
    ) -> Result<Vec<ObjectRef>, StoreError> {
        validate_name(namespace.as_str())?;
        let dir = self.namespace_dir(namespace);
        ensure_dir(&dir)?;

        // Stage every changed object before renaming anything into place.
        let mut refs = Vec::with_capacity(objects.len());
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut wanted = BTreeSet::new();
        for object in &objects {
            validate_name(&object.name)?;
            wanted.insert(object.name.clone());

            let revision = revision_of(object);
            refs.push(ObjectRef {
                name: object.name.clone(),
                namespace: namespace.clone(),
                revision: revision.clone(),
            });

            let meta_path = dir.join(format!("{}.yaml", object.name));
            let content_path = dir.join(format!("{}.bin", object.name));
            if let Some(existing) = read_metadata(&meta_path)? {
                if existing.revision == revision && existing.owner.uid == owner.uid && content_path.exists() {
                    continue;
                }
            }

            let meta = ObjectMetadata {
                name: object.name.clone(),
                namespace: namespace.clone(),
                owner: owner.clone(),
                annotations: object.annotations.clone(),
                revision,
            };
            let yaml = serde_yaml::to_string(&meta)?;
            let staged_files = [(content_path, object.content.as_slice()), (meta_path, yaml.as_bytes())];
            for (path, bytes) in staged_files {
                let tmp = tmp_path(&path);
                if let Err(err) = stage(&tmp, bytes) {
                    discard(&staged);
                    let _ = std::fs::remove_file(&tmp);
                    return Err(err);
                }
                staged.push((tmp, path));
            }
        }

        for (tmp, path) in &staged {
            std::fs::rename(tmp, path).map_err(|e| {
                discard(&staged);
                io_err(path, e)
            })?;
        }

        for meta in read_metadata_dir(&dir)? {
            if meta.owner.uid == owner.uid && !wanted.contains(&meta.name) {
                self.remove_files(&dir, &meta.name)?;
            }
        }

        Ok(refs)
    }
}

/// First 16 hex chars of SHA-256 over annotations and content.
fn revision_of(object: &StoredObject) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in &object.annotations {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(&object.content);
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(16);
    digest
}

fn read_metadata(path: &Path) -> Result<Option<ObjectMetadata>, StoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(path, err)),
    };
    serde_yaml::from_str(&contents)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn read_metadata_dir(dir: &Path) -> Result<Vec<ObjectMetadata>, StoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(io_err(dir, err)),
    };
    let mut metas = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| io_err(dir, e))?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("yaml") {
            continue;
        }
        if let Some(meta) = read_metadata(&path)? {
            metas.push(meta);
        }
    }
    Ok(metas)
}

fn discard(staged: &[(PathBuf, PathBuf)]) {
    for (tmp, _) in staged {
        let _ = std::fs::remove_file(tmp);
    }
}
