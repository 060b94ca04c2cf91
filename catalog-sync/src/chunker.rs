//! Index chunking and publication.
//!
//! ## `publish` protocol
//!
//! 1. Sort entries so identical input yields identical bytes.
//! 2. Encode as JSON and gzip into one in-memory payload.
//! 3. Resolve the effective namespace (empty → system namespace).
//! 4. Split the payload into slices of at most `max_chunk_size` bytes.
//! 5. Name slice `i` as `<owner>-<i>-<uid>` (bounded to 63 chars).
//! 6. Annotate each slice with the next slice's name (empty on the last)
//!    and the decimal total payload length.
//! 7. Apply the whole set in one owner-scoped write and return the root.
//!
//! The size annotation is repeated on every chunk so a watcher of the root
//! chunk alone still sees the payload grow or shrink.

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use sha2::{Digest, Sha256};

use catalog_core::{
    types::{IndexDocument, Namespace, ObjectRef, OwnerReference, Uid},
    ObjectStore, Settings, StoredObject,
};

use crate::error::{io_err, SyncError};

/// Annotation naming the next chunk of a chain; empty on the last chunk.
pub const ANNOTATION_NEXT: &str = "catalog.io/next";
/// Annotation carrying the total payload length, identical on every chunk.
pub const ANNOTATION_SIZE: &str = "catalog.io/size";

/// Longest object name produced by [`safe_concat_name`].
const MAX_NAME_LEN: usize = 63;
/// Prefix kept when a name has to be shortened.
const TRUNCATED_PREFIX_LEN: usize = 57;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Sort, JSON-encode and gzip an index document.
pub fn encode_index(index: &mut IndexDocument) -> Result<Vec<u8>, SyncError> {
    index.sort_entries();
    let json = serde_json::to_vec(index)?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder.write_all(&json).map_err(|e| io_err("<gzip>", e))?;
    encoder.finish().map_err(|e| io_err("<gzip>", e))
}

/// Inverse of [`encode_index`].
pub fn decode_index(payload: &[u8]) -> Result<IndexDocument, SyncError> {
    let mut json = Vec::new();
    GzDecoder::new(payload)
        .read_to_end(&mut json)
        .map_err(|e| io_err("<gunzip>", e))?;
    Ok(serde_json::from_slice(&json)?)
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Namespace chunks are written to: the repository's own, or the system
/// namespace for cluster-scoped repositories.
pub fn effective_namespace(namespace: &Namespace, settings: &Settings) -> Namespace {
    if namespace.is_empty() {
        Namespace::from(settings.system_namespace.as_str())
    } else {
        namespace.clone()
    }
}

/// Join `parts` with `-`. Results longer than 63 characters keep a
/// 57-character prefix followed by `-` and 5 hex characters of the
/// SHA-256 of the full name, so distinct inputs stay distinct.
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() <= MAX_NAME_LEN {
        return full;
    }
    let digest = hex::encode(Sha256::digest(full.as_bytes()));
    let prefix: String = full.chars().take(TRUNCATED_PREFIX_LEN).collect();
    // Names must start alphanumeric and end alphanumeric before the hash separator.
    let prefix = prefix.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if prefix.is_empty() {
        return digest[..MAX_NAME_LEN].to_string();
    }
    format!("{prefix}-{}", &digest[..5])
}

/// Deterministic name of chunk `index` for the owner `name`/`uid`.
pub fn chunk_name(owner_name: &str, index: usize, uid: &Uid) -> String {
    safe_concat_name(&[owner_name, &index.to_string(), &uid.0])
}

// ---------------------------------------------------------------------------
// Splitting
// ---------------------------------------------------------------------------

/// Split `payload` into owned, linked chunks of at most `max` bytes. An
/// empty payload still produces a single (empty) root chunk.
pub fn split_chunks(
    payload: &[u8],
    owner: &OwnerReference,
    namespace: &Namespace,
    max: usize,
) -> Vec<StoredObject> {
    let mut slices: Vec<&[u8]> = payload.chunks(max.max(1)).collect();
    if slices.is_empty() {
        slices.push(&[]);
    }
    let count = slices.len();
    let size = payload.len().to_string();

    slices
        .into_iter()
        .enumerate()
        .map(|(i, bytes)| {
            let next = if i + 1 < count {
                chunk_name(&owner.name, i + 1, &owner.uid)
            } else {
                String::new()
            };
            let mut annotations = BTreeMap::new();
            annotations.insert(ANNOTATION_NEXT.to_string(), next);
            annotations.insert(ANNOTATION_SIZE.to_string(), size.clone());
            StoredObject {
                name: chunk_name(&owner.name, i, &owner.uid),
                namespace: namespace.clone(),
                owner: owner.clone(),
                annotations,
                content: bytes.to_vec(),
                revision: String::new(),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Publish / read back
// ---------------------------------------------------------------------------

/// Encode, split and write `index` as one owner-scoped chain. Returns the
/// identity of the root chunk.
pub fn publish(
    store: &dyn ObjectStore,
    namespace: &Namespace,
    owner: &OwnerReference,
    index: &mut IndexDocument,
    settings: &Settings,
) -> Result<ObjectRef, SyncError> {
    let payload = encode_index(index)?;
    let namespace = effective_namespace(namespace, settings);
    let chunks = split_chunks(&payload, owner, &namespace, settings.max_chunk_size);
    let count = chunks.len();

    let refs = store.apply_owned(owner, &namespace, chunks)?;
    let root = refs.into_iter().next().ok_or_else(|| SyncError::BrokenChain {
        root: chunk_name(&owner.name, 0, &owner.uid),
        reason: "store returned no objects".to_string(),
    })?;

    tracing::info!(
        "published {}: {} chunk(s), {} bytes, root {}@{}",
        owner.name,
        count,
        payload.len(),
        root.name,
        root.revision
    );
    Ok(root)
}

/// Reassemble the chain rooted at `root` and decode it.
///
/// Every chunk must exist, carry the same size annotation, and the chain
/// must terminate; the reassembled length must equal the annotation.
pub fn read_chain(store: &dyn ObjectStore, root: &ObjectRef) -> Result<IndexDocument, SyncError> {
    let broken = |reason: String| SyncError::BrokenChain {
        root: root.name.clone(),
        reason,
    };

    let mut payload = Vec::new();
    let mut seen = HashSet::new();
    let mut expected_size: Option<String> = None;
    let mut name = root.name.clone();

    loop {
        if !seen.insert(name.clone()) {
            return Err(broken(format!("cycle at {name}")));
        }
        let chunk = store
            .get(&root.namespace, &name)?
            .ok_or_else(|| broken(format!("missing chunk {name}")))?;

        let size = chunk
            .annotation(ANNOTATION_SIZE)
            .ok_or_else(|| broken(format!("{name} has no size annotation")))?;
        match &expected_size {
            None => expected_size = Some(size.to_string()),
            Some(expected) if expected != size => {
                return Err(broken(format!(
                    "{name} records size {size}, root records {expected}"
                )));
            }
            Some(_) => {}
        }

        payload.extend_from_slice(&chunk.content);
        match chunk.annotation(ANNOTATION_NEXT) {
            Some(next) if !next.is_empty() => name = next.to_string(),
            _ => break,
        }
    }

    let recorded = expected_size.unwrap_or_default();
    let expected: usize = recorded
        .parse()
        .map_err(|_| broken(format!("size annotation {recorded:?} is not a number")))?;
    if payload.len() != expected {
        return Err(broken(format!(
            "reassembled {} bytes, expected {expected}",
            payload.len()
        )));
    }

    tracing::debug!("read {} chunk(s) from {}", seen.len(), root.name);
    decode_index(&payload)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
