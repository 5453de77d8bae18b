//! Cluster driver: runs the reconciler under kube-runtime's `Controller`,
//! which owns the watches, per-object scheduling and requeue timers.
//! VirtualService events reach their TrafficSplit through the controller
//! owner reference.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::StreamExt;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::Api;
use meshsplit_core::{ObjectKey, TrafficSplit, UnknownKind, VirtualService};
use meshsplit_kubehub::KubeStore;
use meshsplit_store::StateStore;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::reconciler::{ReconcileError, Reconciler};

/// Shared state handed to every reconcile and error-policy call.
pub struct Context<S> {
    reconciler: Reconciler<S>,
    config: ControllerConfig,
    failures: Mutex<FxHashMap<ObjectKey, u32>>,
}

impl<S: StateStore> Context<S> {
    pub fn new(reconciler: Reconciler<S>, config: ControllerConfig) -> Self {
        Self { reconciler, config, failures: Mutex::new(FxHashMap::default()) }
    }

    /// Consecutive failures recorded for `key`.
    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.failures_map().get(key).copied().unwrap_or(0)
    }

    fn failures_map(&self) -> MutexGuard<'_, FxHashMap<ObjectKey, u32>> {
        // the map only holds counters, a poisoned one is still usable
        self.failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reconcile one TrafficSplit and translate the outcome into an `Action`.
pub async fn reconcile_split<S: StateStore>(split: Arc<TrafficSplit>, ctx: Arc<Context<S>>) -> Result<Action, ReconcileError> {
    let Some(key) = ObjectKey::of(split.as_ref()) else {
        warn!("TrafficSplit without name or namespace; ignoring");
        return Ok(Action::await_change());
    };
    let t0 = Instant::now();
    let res = ctx.reconciler.reconcile(&key).await;
    histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    let done = res?;
    counter!("reconcile_total", 1u64, "change" => done.change.as_str());
    ctx.failures_map().remove(&key);
    debug!(key = %key, change = done.change.as_str(), "reconciled");
    Ok(match done.requeue_after {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

/// Retryable errors back off exponentially per object; the rest retry at
/// the ceiling so they stay visible.
pub fn error_policy<S: StateStore>(split: Arc<TrafficSplit>, err: &ReconcileError, ctx: Arc<Context<S>>) -> Action {
    counter!("reconcile_errors_total", 1u64);
    let Some(key) = ObjectKey::of(split.as_ref()) else {
        return Action::requeue(ctx.config.backoff_max);
    };
    let n = {
        let mut failures = ctx.failures_map();
        let n = failures.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        *n
    };
    if err.is_retryable() {
        let delay = ctx.config.backoff(n);
        warn!(key = %key, error = %err, attempt = n, retry_in = ?delay, "reconcile failed; retrying");
        Action::requeue(delay)
    } else {
        error!(key = %key, error = %err, retry_in = ?ctx.config.backoff_max, "reconcile failed");
        Action::requeue(ctx.config.backoff_max)
    }
}

/// Run until SIGINT/SIGTERM against the cluster behind `store`.
pub async fn run(store: Arc<KubeStore>, config: ControllerConfig) -> Result<(), UnknownKind> {
    let client = store.client().clone();
    let (splits, derived): (Api<TrafficSplit>, Api<VirtualService>) = match config.namespace.as_deref() {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client, ns)),
        None => (Api::all(client.clone()), Api::all(client)),
    };
    let concurrency = u16::try_from(config.concurrency.max(1)).unwrap_or(u16::MAX);
    let ctx = Arc::new(Context::new(Reconciler::new(store)?, config));
    info!(concurrency, "controller started");

    Controller::new(splits, watcher::Config::default())
        .owns(derived, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile_split::<KubeStore>, error_policy::<KubeStore>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(object = %obj, "reconcile settled"),
                Err(e) => debug!(error = %e, "controller event"),
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}
