//! meshsplit kubehub: the cluster-backed store gateway and watcher wiring.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use futures::StreamExt;
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject, ErrorResponse, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client, ResourceExt,
};
use meshsplit_core::{KindKey, Notification, ObjectKey, Scheme};
use meshsplit_store::{key_of, StateStore, StoreError, StoreResult, StoredKind};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DEFAULT_FEED_CAP: usize = 2048;

/// Store gateway backed by the Kubernetes API server. Updates are full
/// replaces carrying the caller's resourceVersion, so the API server's
/// optimistic concurrency check applies.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    scheme: Scheme,
    namespace: Option<String>,
    feed_cap: usize,
}

impl KubeStore {
    pub fn new(client: Client, scheme: Scheme) -> Self {
        Self { client, scheme, namespace: None, feed_cap: DEFAULT_FEED_CAP }
    }

    /// Connect using the ambient kubeconfig or in-cluster config.
    pub async fn try_default(scheme: Scheme) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, scheme))
    }

    /// Restrict the watch feed to one namespace (`None` watches all).
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_feed_capacity(mut self, cap: usize) -> Self {
        self.feed_cap = cap.max(1);
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: StoredKind>(&self, namespace: &str) -> StoreResult<Api<K>> {
        self.scheme.require::<K>()?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }
}

#[async_trait::async_trait]
impl StateStore for KubeStore {
    fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    async fn get<K: StoredKind>(&self, key: &ObjectKey) -> StoreResult<K> {
        self.api::<K>(&key.namespace)?.get(&key.name).await.map_err(classify)
    }

    async fn create<K: StoredKind>(&self, obj: &K) -> StoreResult<K> {
        let key = key_of(obj)?;
        self.api::<K>(&key.namespace)?.create(&PostParams::default(), obj).await.map_err(classify)
    }

    async fn update<K: StoredKind>(&self, obj: &K) -> StoreResult<K> {
        let key = key_of(obj)?;
        self.api::<K>(&key.namespace)?
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(classify)
    }

    async fn watch(&self) -> StoreResult<mpsc::Receiver<Notification>> {
        let (tx, rx) = mpsc::channel(self.feed_cap);
        for kind in self.scheme.kinds() {
            let ar = api_resource(kind);
            let api: Api<DynamicObject> = match self.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::all_with(self.client.clone(), &ar),
            };
            tokio::spawn(pump(kind.clone(), api, tx.clone()));
        }
        Ok(rx)
    }
}

/// Map a kube client error onto the store taxonomy.
pub fn classify(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ErrorResponse { code, reason, message, .. }) => match (code, reason.as_str()) {
            (404, _) => StoreError::NotFound(message),
            (409, "AlreadyExists") => StoreError::AlreadyExists(message),
            (409, _) => StoreError::Conflict(message),
            (400 | 422, _) => StoreError::Invalid(message),
            _ => StoreError::Transport(format!("{message} ({code} {reason})")),
        },
        kube::Error::SerdeError(e) => StoreError::Decode(e.to_string()),
        other => StoreError::Transport(other.to_string()),
    }
}

fn api_resource(kind: &KindKey) -> ApiResource {
    let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
    ApiResource::from_gvk_with_plural(&gvk, &kind.plural)
}

fn notification_from(kind: &KindKey, obj: &DynamicObject, deleted: bool) -> Option<Notification> {
    let key = ObjectKey::of(obj)?;
    Some(Notification { kind: kind.clone(), key, labels: obj.labels().clone(), deleted })
}

/// List+watch one kind and forward notifications until the receiver goes away.
/// Watch errors are retried with the runtime's default backoff.
async fn pump(kind: KindKey, api: Api<DynamicObject>, tx: mpsc::Sender<Notification>) {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(gvk = %kind, "watcher started");
    while let Some(ev) = stream.next().await {
        let batch: Vec<Notification> = match ev {
            Ok(Event::Applied(o)) => notification_from(&kind, &o, false).into_iter().collect(),
            Ok(Event::Deleted(o)) => notification_from(&kind, &o, true).into_iter().collect(),
            Ok(Event::Restarted(list)) => {
                debug!(gvk = %kind, count = list.len(), "watch restart");
                list.iter().filter_map(|o| notification_from(&kind, o, false)).collect()
            }
            Err(e) => {
                counter!("watch_errors_total", 1u64);
                warn!(gvk = %kind, error = %e, "watch error; backing off");
                continue;
            }
        };
        for n in batch {
            counter!("watch_events_total", 1u64);
            if tx.send(n).await.is_err() {
                debug!(gvk = %kind, "notification receiver dropped; stopping watcher");
                return;
            }
        }
    }
    warn!(gvk = %kind, "watcher stream ended");
}

/// Check that every kind in `scheme` is served by the cluster, so a missing
/// CRD (for example Istio not installed) fails at startup instead of on every
/// reconcile.
pub async fn preflight(client: Client, scheme: &Scheme) -> Result<()> {
    let discovery = Discovery::new(client).run().await?;
    let mut missing = Vec::new();
    for kind in scheme.kinds() {
        let served = discovery.groups().any(|group| {
            group.recommended_resources().into_iter().any(|(ar, caps)| {
                ar.group == kind.group
                    && ar.version == kind.version
                    && ar.kind == kind.kind
                    && matches!(caps.scope, Scope::Namespaced)
            })
        });
        if served {
            info!(gvk = %kind, "kind served");
        } else {
            warn!(gvk = %kind, "kind not served by the cluster");
            missing.push(kind.gvk_key());
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("kinds not served (is the CRD installed?): {}", missing.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsplit_core::{ownership, TrafficSplit, VirtualService};

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} happened"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn classifies_api_errors() {
        assert!(matches!(classify(api_error(404, "NotFound")), StoreError::NotFound(_)));
        assert!(matches!(classify(api_error(409, "AlreadyExists")), StoreError::AlreadyExists(_)));
        assert!(matches!(classify(api_error(409, "Conflict")), StoreError::Conflict(_)));
        assert!(matches!(classify(api_error(422, "Invalid")), StoreError::Invalid(_)));
        assert!(matches!(classify(api_error(403, "Forbidden")), StoreError::Transport(_)));
        assert!(matches!(classify(api_error(503, "ServiceUnavailable")), StoreError::Transport(_)));
    }

    #[test]
    fn classifies_decode_errors() {
        let serde = serde_json::from_str::<u32>("not a number").unwrap_err();
        assert!(matches!(classify(kube::Error::SerdeError(serde)), StoreError::Decode(_)));
    }

    #[test]
    fn api_resource_uses_registered_plural() {
        let ar = api_resource(&KindKey::of::<VirtualService>());
        assert_eq!(ar.api_version, "networking.istio.io/v1alpha3");
        assert_eq!(ar.plural, "virtualservices");
        let ar = api_resource(&KindKey::of::<TrafficSplit>());
        assert_eq!(ar.plural, "trafficsplits");
    }

    #[test]
    fn notifications_carry_key_and_labels() {
        let kind = KindKey::of::<VirtualService>();
        let mut obj = DynamicObject::new("web-vs", &api_resource(&kind)).within("prod");
        obj.metadata.labels = Some(ownership::owner_labels("web"));
        let n = notification_from(&kind, &obj, true).unwrap();
        assert_eq!(n.key, ObjectKey::new("prod", "web-vs"));
        assert!(n.deleted);
        assert_eq!(ownership::request_for(&n), Some(ObjectKey::new("prod", "web")));

        let cluster_scoped = DynamicObject::new("web-vs", &api_resource(&kind));
        assert!(notification_from(&kind, &cluster_scoped, false).is_none());
    }
}
