//! Coalescing work queue keyed by reconcile request.

use std::collections::VecDeque;

use meshsplit_core::ObjectKey;
use rustc_hash::FxHashSet;

/// FIFO of distinct keys.
///
/// A key is queued at most once no matter how many notifications arrive for
/// it, so the queue is bounded by the number of objects and never evicts.
/// A key handed out by `pop` stays "running" until `done`; pushes during that
/// window mark it dirty and it is queued again on `done`, so one key is never
/// reconciled twice at the same time and no change is lost.
#[derive(Default)]
pub struct WorkQueue {
    queued: FxHashSet<ObjectKey>,
    order: VecDeque<ObjectKey>,
    running: FxHashSet<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
    pub fn running(&self) -> usize { self.running.len() }

    pub fn push(&mut self, key: ObjectKey) {
        if self.running.contains(&key) {
            self.dirty.insert(key);
            return;
        }
        if self.queued.insert(key.clone()) {
            self.order.push_back(key);
        }
    }

    /// Next key to reconcile; it is marked running.
    pub fn pop(&mut self) -> Option<ObjectKey> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        self.running.insert(key.clone());
        Some(key)
    }

    /// Release a running key, re-queueing it if it was notified meanwhile.
    pub fn done(&mut self, key: &ObjectKey) {
        self.running.remove(key);
        if self.dirty.remove(key) {
            self.push(key.clone());
        }
    }
}
