//! meshsplit core types: object identity, the known-kinds scheme, and the
//! TrafficSplit -> VirtualService translation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use kube::Resource;
use serde::{Deserialize, Serialize};

pub mod builder;
pub mod ownership;
pub mod resources;

pub use builder::build_virtual_service;
pub use resources::{
    Destination, HttpRoute, HttpRouteDestination, TrafficSplit, TrafficSplitBackend,
    TrafficSplitSpec, VirtualService, VirtualServiceSpec, WeightedDestination,
};

pub mod prelude {
    pub use super::{
        build_virtual_service, KindKey, Notification, ObjectKey, Scheme, TrafficSplit,
        TrafficSplitBackend, TrafficSplitSpec, VirtualService, VirtualServiceSpec,
    };
}

/// Namespaced identity of a stored object. Also the reconcile request: it never
/// carries a payload, the reconciler always re-reads current state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key of an object read from the store; `None` when name or namespace is unset.
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self { namespace: meta.namespace.clone()?, name: meta.name.clone()? })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Group/version/kind plus plural of a registered object kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KindKey {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl KindKey {
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self {
            group: K::group(&()).into_owned(),
            version: K::version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            plural: K::plural(&()).into_owned(),
        }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl fmt::Display for KindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("kind {0} is not registered in the scheme")]
pub struct UnknownKind(pub String);

/// Explicit registry of the kinds a gateway or reconciler operates on.
/// Built once at startup and handed to each component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scheme {
    kinds: Vec<KindKey>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// The scheme this controller runs with: TrafficSplit in, VirtualService out.
    pub fn traffic_split() -> Self {
        Self::new().with::<TrafficSplit>().with::<VirtualService>()
    }

    pub fn with<K: Resource<DynamicType = ()>>(mut self) -> Self {
        let kind = KindKey::of::<K>();
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
        self
    }

    pub fn kinds(&self) -> &[KindKey] {
        &self.kinds
    }

    pub fn recognizes(&self, kind: &KindKey) -> bool {
        self.kinds.contains(kind)
    }

    pub fn require<K: Resource<DynamicType = ()>>(&self) -> Result<KindKey, UnknownKind> {
        let kind = KindKey::of::<K>();
        if self.recognizes(&kind) {
            Ok(kind)
        } else {
            Err(UnknownKind(kind.gvk_key()))
        }
    }
}

/// One entry of a store's change feed. Delivery is at-least-once and unordered;
/// consumers only use it to decide which key to look at again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: KindKey,
    pub key: ObjectKey,
    /// Labels of the object as seen by the feed, used to route derived-kind
    /// events back to their owner.
    pub labels: BTreeMap<String, String>,
    pub deleted: bool,
}
