//! Dispatcher: turns a store's notification feed into reconciles on a
//! bounded pool, with per-key coalescing and exponential backoff requeue.
//!
//! Works over any `StateStore`, so the in-memory store can drive the same
//! loop as the cluster. In-flight reconciles and pending retry timers are
//! owned by the loop itself and go away with it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use meshsplit_core::{ownership, ObjectKey};
use meshsplit_store::{StateStore, StoreError};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::queue::WorkQueue;
use crate::reconciler::{ReconcileError, Reconciled, Reconciler};

/// Counters reported when the dispatcher stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub reconciled: u64,
    pub failed: u64,
    pub requeued: u64,
}

/// Handle to a running dispatcher.
pub struct DispatchHandle {
    cancel: Option<oneshot::Sender<()>>,
    enqueue: mpsc::Sender<ObjectKey>,
    join: JoinHandle<DispatchStats>,
}

impl DispatchHandle {
    /// Queue a reconcile for `key` without waiting for a notification.
    pub async fn enqueue(&self, key: ObjectKey) -> bool {
        self.enqueue.send(key).await.is_ok()
    }

    /// Stop taking new work, wait for in-flight reconciles, drop pending
    /// retries and return counters.
    pub async fn shutdown(mut self) -> DispatchStats {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        match self.join.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "dispatcher task failed");
                DispatchStats::default()
            }
        }
    }
}

enum Outcome {
    Done(Reconciled),
    Failed(ReconcileError),
    Panicked,
}

type Finished = (ObjectKey, Outcome, Duration);

struct Loop {
    config: ControllerConfig,
    queue: WorkQueue,
    failures: FxHashMap<ObjectKey, u32>,
    stats: DispatchStats,
    timers: FuturesUnordered<BoxFuture<'static, ObjectKey>>,
}

/// Subscribe to the store's feed and spawn the dispatch loop.
pub async fn spawn<S>(reconciler: Arc<Reconciler<S>>, config: ControllerConfig) -> Result<DispatchHandle, StoreError>
where
    S: StateStore + 'static,
{
    let mut feed = reconciler.store().watch().await?;
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    let (enqueue_tx, mut enqueue_rx) = mpsc::channel::<ObjectKey>(config.queue_cap.max(1));

    let join = tokio::spawn(async move {
        let concurrency = config.concurrency.max(1);
        info!(concurrency, "dispatcher started");
        let mut workers: FuturesUnordered<BoxFuture<'static, Finished>> = FuturesUnordered::new();
        let mut lp = Loop {
            config,
            queue: WorkQueue::new(),
            failures: FxHashMap::default(),
            stats: DispatchStats::default(),
            timers: FuturesUnordered::new(),
        };
        let mut feed_open = true;

        loop {
            while workers.len() < concurrency {
                let Some(key) = lp.queue.pop() else { break };
                workers.push(run_one(Arc::clone(&reconciler), key));
            }

            tokio::select! {
                _ = &mut cancel_rx => {
                    debug!("shutdown requested; draining in-flight reconciles");
                    break;
                }
                maybe = feed.recv(), if feed_open => match maybe {
                    Some(n) => {
                        if let Some(key) = ownership::request_for(&n) {
                            lp.queue.push(key);
                        }
                    }
                    None => {
                        warn!("notification feed closed; only requeues will be processed");
                        feed_open = false;
                    }
                },
                Some(key) = enqueue_rx.recv() => lp.queue.push(key),
                Some(key) = lp.timers.next(), if !lp.timers.is_empty() => lp.queue.push(key),
                Some(finished) = workers.next(), if !workers.is_empty() => lp.settle(finished),
            }
        }

        while let Some(finished) = workers.next().await {
            lp.settle(finished);
        }
        if !lp.timers.is_empty() {
            debug!(pending = lp.timers.len(), "dropping pending retries");
        }
        let stats = lp.stats;
        info!(reconciled = stats.reconciled, failed = stats.failed, requeued = stats.requeued, "dispatcher stopped");
        stats
    });

    Ok(DispatchHandle { cancel: Some(cancel_tx), enqueue: enqueue_tx, join })
}

fn run_one<S>(reconciler: Arc<Reconciler<S>>, key: ObjectKey) -> BoxFuture<'static, Finished>
where
    S: StateStore + 'static,
{
    async move {
        let t0 = Instant::now();
        let outcome = match AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind().await {
            Ok(Ok(done)) => Outcome::Done(done),
            Ok(Err(e)) => Outcome::Failed(e),
            Err(_) => Outcome::Panicked,
        };
        (key, outcome, t0.elapsed())
    }
    .boxed()
}

impl Loop {
    fn settle(&mut self, (key, outcome, took): Finished) {
        histogram!("reconcile_latency_ms", took.as_secs_f64() * 1000.0);
        self.queue.done(&key);
        match outcome {
            Outcome::Done(done) => {
                counter!("reconcile_total", 1u64, "change" => done.change.as_str());
                self.stats.reconciled += 1;
                self.failures.remove(&key);
                debug!(key = %key, change = done.change.as_str(), "reconciled");
                if let Some(after) = done.requeue_after {
                    self.requeue_after(key, after);
                }
            }
            Outcome::Failed(e) => {
                counter!("reconcile_errors_total", 1u64);
                self.stats.failed += 1;
                let n = self.failures.entry(key.clone()).or_insert(0);
                *n = n.saturating_add(1);
                let delay = if e.is_retryable() {
                    let delay = self.config.backoff(*n);
                    warn!(key = %key, error = %e, attempt = *n, retry_in = ?delay, "reconcile failed; retrying");
                    delay
                } else {
                    error!(key = %key, error = %e, retry_in = ?self.config.backoff_max, "reconcile failed");
                    self.config.backoff_max
                };
                self.requeue_after(key, delay);
            }
            Outcome::Panicked => {
                counter!("reconcile_errors_total", 1u64);
                self.stats.failed += 1;
                error!(key = %key, retry_in = ?self.config.backoff_max, "reconcile panicked");
                let delay = self.config.backoff_max;
                self.requeue_after(key, delay);
            }
        }
    }

    fn requeue_after(&mut self, key: ObjectKey, after: Duration) {
        self.stats.requeued += 1;
        self.timers.push(
            async move {
                tokio::time::sleep(after).await;
                key
            }
            .boxed(),
        );
    }
}
