#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use meshsplit_controller::{spawn, ControllerConfig, DispatchHandle, Reconciler};
use meshsplit_core::{ObjectKey, Scheme, TrafficSplit, TrafficSplitBackend, TrafficSplitSpec, VirtualService};
use meshsplit_store::{MemoryStore, Op, StateStore, StoreError};

fn split(name: &str, backends: &[(&str, u32)]) -> TrafficSplit {
    let mut ts = TrafficSplit::new(
        name,
        TrafficSplitSpec {
            service: "web".into(),
            backends: backends.iter().map(|(s, w)| TrafficSplitBackend { service: s.to_string(), weight: *w }).collect(),
        },
    );
    ts.metadata.namespace = Some("default".into());
    ts
}

fn key(name: &str) -> ObjectKey { ObjectKey::new("default", name) }

fn config() -> ControllerConfig {
    ControllerConfig {
        concurrency: 2,
        queue_cap: 64,
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(200),
        namespace: None,
    }
}

async fn start(store: &Arc<MemoryStore>) -> DispatchHandle {
    let r = Arc::new(Reconciler::new(Arc::clone(store)).unwrap());
    spawn(r, config()).await.unwrap()
}

async fn weights_of(store: &MemoryStore, name: &str) -> Option<Vec<u32>> {
    let vs: VirtualService = store.get(&key(name)).await.ok()?;
    Some(vs.weighted_destinations().into_iter().map(|d| d.weight).collect())
}

/// Poll the derived object until its weights satisfy `want` or five seconds pass.
async fn settles(store: &MemoryStore, name: &str, want: impl Fn(&[u32]) -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if weights_of(store, name).await.is_some_and(|w| want(&w)) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn created_split_converges() {
    let store = Arc::new(MemoryStore::new(Scheme::traffic_split()));
    let handle = start(&store).await;

    store.create(&split("web", &[("web-v1", 90), ("web-v2", 10)])).await.unwrap();
    assert!(settles(&store, "web-vs", |w| w == [90, 10]).await);

    let stats = handle.shutdown().await;
    assert!(stats.reconciled >= 1, "{stats:?}");
    assert_eq!(stats.failed, 0);
    assert_eq!(store.creates(), 2);
}

#[tokio::test]
async fn split_update_propagates() {
    let store = Arc::new(MemoryStore::new(Scheme::traffic_split()));
    let handle = start(&store).await;
    store.create(&split("web", &[("web-v1", 90), ("web-v2", 10)])).await.unwrap();
    assert!(settles(&store, "web-vs", |_| true).await);

    let mut ts: TrafficSplit = store.get(&key("web")).await.unwrap();
    ts.spec.backends[0].weight = 50;
    ts.spec.backends[1].weight = 50;
    store.update(&ts).await.unwrap();
    assert!(settles(&store, "web-vs", |w| w == [50, 50]).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn derived_drift_is_repaired() {
    let store = Arc::new(MemoryStore::new(Scheme::traffic_split()));
    let handle = start(&store).await;
    store.create(&split("web", &[("web-v1", 1)])).await.unwrap();
    assert!(settles(&store, "web-vs", |w| w == [1]).await);

    let mut vs: VirtualService = store.get(&key("web-vs")).await.unwrap();
    vs.spec.http[0].route[0].weight = 42;
    store.update(&vs).await.unwrap();

    assert!(settles(&store, "web-vs", |w| w == [1]).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let store = Arc::new(MemoryStore::new(Scheme::traffic_split()));
    store.inject_on::<VirtualService>(Op::Create, StoreError::Transport("connection reset".into())).unwrap();
    store.inject_on::<VirtualService>(Op::Create, StoreError::Transport("connection reset".into())).unwrap();
    let handle = start(&store).await;

    store.create(&split("web", &[("web-v1", 1)])).await.unwrap();
    assert!(settles(&store, "web-vs", |_| true).await);

    let stats = handle.shutdown().await;
    assert_eq!(stats.failed, 2, "{stats:?}");
    assert!(stats.requeued >= 2);
}

#[tokio::test]
async fn enqueue_reconciles_existing_objects() {
    let store = Arc::new(MemoryStore::new(Scheme::traffic_split()));
    store.create(&split("web", &[("web-v1", 1)])).await.unwrap();
    let handle = start(&store).await;

    assert!(handle.enqueue(key("web")).await);
    assert!(settles(&store, "web-vs", |_| true).await);
    handle.shutdown().await;
}

#[tokio::test]
async fn unrelated_notifications_are_ignored() {
    let store = Arc::new(MemoryStore::new(Scheme::traffic_split()));
    let handle = start(&store).await;

    let mut stray = VirtualService::new("stray", Default::default());
    stray.metadata.namespace = Some("default".into());
    store.create(&stray).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = handle.shutdown().await;
    assert_eq!(stats.reconciled, 0);
    assert_eq!(store.creates(), 1);
}

#[tokio::test]
async fn shutdown_without_work_is_clean() {
    let store = Arc::new(MemoryStore::new(Scheme::traffic_split()));
    let handle = start(&store).await;
    let stats = handle.shutdown().await;
    assert_eq!(stats, Default::default());
}

#[tokio::test]
async fn backlog_beyond_channel_capacity_is_not_lost() {
    let store = Arc::new(MemoryStore::new(Scheme::traffic_split()));
    let r = Arc::new(Reconciler::new(Arc::clone(&store)).unwrap());
    let handle = spawn(r, ControllerConfig { concurrency: 1, queue_cap: 1, ..config() }).await.unwrap();

    let names: Vec<String> = (0..8).map(|i| format!("svc-{i}")).collect();
    for name in &names {
        store.create(&split(name, &[("web-v1", 1)])).await.unwrap();
    }
    for name in &names {
        assert!(settles(&store, &format!("{name}-vs"), |w| w == [1]).await, "{name}-vs never created");
    }

    let stats = handle.shutdown().await;
    assert_eq!(stats.failed, 0);
    assert_eq!(store.creates(), 16);
}

#[tokio::test]
async fn permanent_failure_retries_at_the_ceiling() {
    let store = Arc::new(MemoryStore::new(Scheme::traffic_split()));
    let handle = start(&store).await;
    store.create(&split("web", &[("web-v1", 1)])).await.unwrap();
    assert!(settles(&store, "web-vs", |w| w == [1]).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let good = serde_json::to_value(store.get::<TrafficSplit>(&key("web")).await.unwrap()).unwrap();
    let mut bad = good.clone();
    bad["spec"]["backends"][0]["weight"] = serde_json::json!(-1);
    store.put_raw::<TrafficSplit>(&key("web"), bad).unwrap();
    let before = store.gets();
    assert!(handle.enqueue(key("web")).await);

    // base backoff would have retried three times by now
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(store.gets() - before, 1);

    let mut fixed = good;
    fixed["spec"]["backends"][0]["weight"] = serde_json::json!(7);
    store.put_raw::<TrafficSplit>(&key("web"), fixed).unwrap();
    assert!(settles(&store, "web-vs", |w| w == [7]).await);

    let stats = handle.shutdown().await;
    assert_eq!(stats.failed, 1, "{stats:?}");
}

#[tokio::test]
async fn backoff_restarts_after_success() {
    let store = Arc::new(MemoryStore::new(Scheme::traffic_split()));
    store.create(&split("web", &[("web-v1", 1)])).await.unwrap();
    for _ in 0..4 {
        store.inject_on::<TrafficSplit>(Op::Get, StoreError::Transport("connection reset".into())).unwrap();
    }
    let handle = start(&store).await;
    assert!(handle.enqueue(key("web")).await);
    assert!(settles(&store, "web-vs", |w| w == [1]).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut ts: TrafficSplit = store.get(&key("web")).await.unwrap();
    ts.spec.backends[0].weight = 3;
    // four earlier failures would put the next retry at 160ms
    store.inject_on::<TrafficSplit>(Op::Get, StoreError::Transport("connection reset".into())).unwrap();
    let t0 = tokio::time::Instant::now();
    store.update(&ts).await.unwrap();
    assert!(settles(&store, "web-vs", |w| w == [3]).await);
    assert!(t0.elapsed() < Duration::from_millis(120), "took {:?}", t0.elapsed());

    let stats = handle.shutdown().await;
    assert_eq!(stats.failed, 5, "{stats:?}");
}

#[tokio::test]
async fn shutdown_drops_pending_retries() {
    let store = Arc::new(MemoryStore::new(Scheme::traffic_split()));
    store.create(&split("web", &[("web-v1", 1)])).await.unwrap();
    store.inject_on::<TrafficSplit>(Op::Get, StoreError::Decode("garbled".into())).unwrap();
    let r = Arc::new(Reconciler::new(Arc::clone(&store)).unwrap());
    let handle = spawn(r, ControllerConfig { backoff_max: Duration::from_secs(3600), ..config() }).await.unwrap();
    assert!(handle.enqueue(key("web")).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = tokio::time::timeout(Duration::from_secs(2), handle.shutdown()).await.expect("shutdown waited on a retry timer");
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.requeued, 1);
    assert!(store.get::<VirtualService>(&key("web-vs")).await.is_err());
}
