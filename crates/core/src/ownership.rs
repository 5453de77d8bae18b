//! Ownership policy linking a VirtualService back to its TrafficSplit.
//!
//! The derived name is a pure function of the owner's name, which is how the
//! reconciler finds "the" derived object without an index. The label allows
//! reverse lookup from a derived-kind event, and the controller owner reference
//! lets the store's garbage collector remove the derived object once its owner
//! is deleted. The reconciler itself never deletes.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

use crate::{KindKey, Notification, ObjectKey, TrafficSplit, VirtualService};

/// Label carrying the owning TrafficSplit's name.
pub const OWNER_LABEL: &str = "traffic-split";

/// Suffix appended to the owner name to form the derived name.
pub const DERIVED_SUFFIX: &str = "-vs";

pub fn derived_name(owner: &str) -> String {
    format!("{owner}{DERIVED_SUFFIX}")
}

pub fn derived_key(owner: &ObjectKey) -> ObjectKey {
    ObjectKey::new(owner.namespace.clone(), derived_name(&owner.name))
}

pub fn owner_labels(owner: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(OWNER_LABEL.to_string(), owner.to_string())])
}

/// Controller reference to `split`; `None` until the store has assigned it a uid.
/// Foreground deletion of the split waits for the derived object.
pub fn owner_reference(split: &TrafficSplit) -> Option<OwnerReference> {
    split
        .controller_owner_ref(&())
        .map(|r| OwnerReference { block_owner_deletion: Some(true), ..r })
}

/// Owner of a derived object according to its label.
pub fn owner_key(vs: &VirtualService) -> Option<ObjectKey> {
    let owner = vs.metadata.labels.as_ref()?.get(OWNER_LABEL)?;
    Some(ObjectKey::new(vs.metadata.namespace.clone()?, owner.clone()))
}

/// True when `vs` carries every ownership marker expected for `split`.
pub fn is_linked(vs: &VirtualService, split: &TrafficSplit) -> bool {
    let labeled = vs
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(OWNER_LABEL))
        .is_some_and(|owner| Some(owner) == split.metadata.name.as_ref());
    if !labeled {
        return false;
    }
    match owner_reference(split) {
        Some(expected) => vs
            .metadata
            .owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|r| r.uid == expected.uid && r.controller == Some(true)),
        None => true,
    }
}

/// Reconcile request for a change notification: the object itself for the
/// desired kind, the labeled owner for the derived kind, nothing otherwise.
pub fn request_for(n: &Notification) -> Option<ObjectKey> {
    if n.kind == KindKey::of::<TrafficSplit>() {
        Some(n.key.clone())
    } else if n.kind == KindKey::of::<VirtualService>() {
        n.labels.get(OWNER_LABEL).map(|owner| ObjectKey::new(n.key.namespace.clone(), owner.clone()))
    } else {
        None
    }
}
