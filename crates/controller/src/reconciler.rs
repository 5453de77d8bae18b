//! The control loop body: converge one TrafficSplit's VirtualService.

use std::sync::Arc;
use std::time::Duration;

use meshsplit_core::{build_virtual_service, ownership, ObjectKey, TrafficSplit, UnknownKind, VirtualService};
use meshsplit_store::{StateStore, StoreError};
use metrics::counter;
use tracing::{debug, info, instrument};

/// What a successful reconcile did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// The TrafficSplit no longer exists; nothing was written.
    OwnerAbsent,
    Created,
    Updated,
    Unchanged,
}

impl Change {
    pub fn as_str(&self) -> &'static str {
        match self {
            Change::OwnerAbsent => "owner_absent",
            Change::Created => "created",
            Change::Updated => "updated",
            Change::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub change: Change,
    /// Ask to be re-run after this delay even without a new notification.
    pub requeue_after: Option<Duration>,
}

impl Reconciled {
    fn done(change: Change) -> Self {
        Self { change, requeue_after: None }
    }
}

/// A store failure and the step it happened in. Classification is the
/// underlying `StoreError`'s.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    #[error("get TrafficSplit {key}: {source}")]
    GetOwner { key: ObjectKey, source: StoreError },
    #[error("get VirtualService {key}: {source}")]
    GetDerived { key: ObjectKey, source: StoreError },
    #[error("create VirtualService {key}: {source}")]
    CreateDerived { key: ObjectKey, source: StoreError },
    #[error("update VirtualService {key}: {source}")]
    UpdateDerived { key: ObjectKey, source: StoreError },
}

impl ReconcileError {
    pub fn store_error(&self) -> &StoreError {
        match self {
            ReconcileError::GetOwner { source, .. }
            | ReconcileError::GetDerived { source, .. }
            | ReconcileError::CreateDerived { source, .. }
            | ReconcileError::UpdateDerived { source, .. } => source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.store_error().is_retryable()
    }
}

pub struct Reconciler<S> {
    store: Arc<S>,
}

impl<S: StateStore> Reconciler<S> {
    /// Fails when the store's scheme does not know both kinds.
    pub fn new(store: Arc<S>) -> Result<Self, UnknownKind> {
        store.scheme().require::<TrafficSplit>()?;
        store.scheme().require::<VirtualService>()?;
        Ok(Self { store })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Converge the VirtualService derived from the TrafficSplit at `key`.
    ///
    /// Every step re-reads the store, so the call is safe to repeat at any
    /// point. A missing TrafficSplit is success; every other store failure is
    /// returned for the caller to retry.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Reconciled, ReconcileError> {
        let split: TrafficSplit = match self.store.get(key).await {
            Ok(split) => split,
            Err(e) if e.is_not_found() => {
                debug!("TrafficSplit not found; nothing to do");
                return Ok(Reconciled::done(Change::OwnerAbsent));
            }
            Err(source) => return Err(ReconcileError::GetOwner { key: key.clone(), source }),
        };

        let target = build_virtual_service(&split);
        let derived = ownership::derived_key(key);
        let change = match self.store.get::<VirtualService>(&derived).await {
            Err(e) if e.is_not_found() => {
                self.store
                    .create(&target)
                    .await
                    .map_err(|source| ReconcileError::CreateDerived { key: derived.clone(), source })?;
                counter!("store_writes_total", 1u64, "op" => "create");
                info!(derived = %derived, destinations = split.spec.backends.len(), "created VirtualService");
                Change::Created
            }
            Err(source) => return Err(ReconcileError::GetDerived { key: derived, source }),
            Ok(found) if found.spec == target.spec && ownership::is_linked(&found, &split) => Change::Unchanged,
            Ok(found) => {
                let next = converge(found, target);
                self.store
                    .update(&next)
                    .await
                    .map_err(|source| ReconcileError::UpdateDerived { key: derived.clone(), source })?;
                counter!("store_writes_total", 1u64, "op" => "update");
                info!(derived = %derived, destinations = split.spec.backends.len(), "updated VirtualService");
                Change::Updated
            }
        };
        Ok(Reconciled::done(change))
    }
}

/// Apply `target`'s spec and ownership onto the stored object, keeping its
/// uid, resourceVersion and any labels or owner references set by others.
fn converge(mut found: VirtualService, target: VirtualService) -> VirtualService {
    found.spec = target.spec;
    found
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .extend(target.metadata.labels.unwrap_or_default());
    if let Some(owner) = target.metadata.owner_references.and_then(|refs| refs.into_iter().next()) {
        let refs = found.metadata.owner_references.get_or_insert_with(Vec::new);
        refs.retain(|r| r.uid != owner.uid && r.controller != Some(true));
        refs.push(owner);
    }
    found
}
