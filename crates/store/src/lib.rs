//! meshsplit store gateway: the only seam between the controller and the
//! shared object store.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use meshsplit_core::{Notification, ObjectKey, Scheme, UnknownKind};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;

mod memory;

pub use memory::{MemoryStore, Op};

/// Store errors, classified the way the control loop needs them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error(transparent)]
    UnknownKind(#[from] UnknownKind),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Whether re-driving the same request can succeed without anything else
    /// changing: lost races and unavailable stores.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_) | StoreError::Conflict(_) | StoreError::Transport(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Namespaced object kinds a gateway can read and write.
pub trait StoredKind:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoredKind for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Capability interface over the shared store.
///
/// Writes are individually atomic; `update` is version-checked against the
/// object's `metadata.resourceVersion` and fails with `Conflict` when stale.
/// Calls on kinds missing from `scheme()` fail with `UnknownKind`.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    fn scheme(&self) -> &Scheme;

    async fn get<K: StoredKind>(&self, key: &ObjectKey) -> StoreResult<K>;

    async fn create<K: StoredKind>(&self, obj: &K) -> StoreResult<K>;

    async fn update<K: StoredKind>(&self, obj: &K) -> StoreResult<K>;

    /// Change feed for every kind in the scheme. At-least-once, possibly
    /// duplicated, coalesced or reordered.
    async fn watch(&self) -> StoreResult<mpsc::Receiver<Notification>>;
}

/// Key of an object about to be written, or `Invalid` if it lacks one.
pub fn key_of<K: Resource>(obj: &K) -> StoreResult<ObjectKey> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::Invalid("object requires metadata.name and metadata.namespace".into()))
}
