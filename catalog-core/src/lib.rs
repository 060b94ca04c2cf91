//! Catalog core library: domain types, repository registry, object store,
//! credentials, settings, errors.
//!
//! - [`types`]: descriptors, status, index document
//! - [`registry`]: descriptor/status load / save
//! - [`store`]: [`ObjectStore`] and its filesystem implementation
//! - [`secrets`]: [`SecretLookup`] and its filesystem implementation
//! - [`config`]: [`Settings`]
//! - [`error`]: [`StoreError`]

pub mod config;
pub mod error;
pub mod registry;
pub mod secrets;
pub mod store;
pub mod types;

pub use config::Settings;
pub use error::StoreError;
pub use secrets::{Credentials, FileSecrets, SecretLookup};
pub use store::{FileStore, ObjectStore, StoredObject};
pub use types::{
    ClusterRepo, ConditionType, IndexDocument, Namespace, ObjectRef, OwnerReference, RepoName,
    RepoSpec, RepoStatus, SourceLocation, TlsPolicy, Uid,
};
