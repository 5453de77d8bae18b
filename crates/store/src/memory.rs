//! In-memory store with the same contract as the cluster-backed gateway:
//! version-checked updates, store-assigned uid/resourceVersion, a change feed,
//! and owner-reference garbage collection on delete. Objects are kept as JSON
//! so reads decode exactly like a real store would.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use meshsplit_core::{KindKey, Notification, ObjectKey, Scheme};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{key_of, StateStore, StoreError, StoreResult, StoredKind};

const DEFAULT_FEED_CAP: usize = 1024;

/// Store operation a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    Update,
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<(KindKey, ObjectKey), Json>,
    last_rv: u64,
    feeds: Vec<mpsc::Sender<Notification>>,
    faults: FxHashMap<(Op, Option<KindKey>), VecDeque<StoreError>>,
}

#[derive(Default)]
struct Counters {
    gets: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
}

pub struct MemoryStore {
    scheme: Scheme,
    feed_cap: usize,
    inner: Mutex<Inner>,
    counters: Counters,
}

impl MemoryStore {
    pub fn new(scheme: Scheme) -> Self {
        Self::with_feed_capacity(scheme, DEFAULT_FEED_CAP)
    }

    pub fn with_feed_capacity(scheme: Scheme, feed_cap: usize) -> Self {
        Self { scheme, feed_cap: feed_cap.max(1), inner: Mutex::new(Inner::default()), counters: Counters::default() }
    }

    pub fn gets(&self) -> u64 {
        self.counters.gets.load(Ordering::Relaxed)
    }
    pub fn creates(&self) -> u64 {
        self.counters.creates.load(Ordering::Relaxed)
    }
    pub fn updates(&self) -> u64 {
        self.counters.updates.load(Ordering::Relaxed)
    }
    pub fn deletes(&self) -> u64 {
        self.counters.deletes.load(Ordering::Relaxed)
    }

    /// Successful mutations of any kind.
    pub fn writes(&self) -> u64 {
        self.creates() + self.updates() + self.deletes()
    }

    /// Fail the next `op` on any kind with `err`. Faults queue up in order.
    pub fn inject(&self, op: Op, err: StoreError) -> StoreResult<()> {
        self.inject_for(op, None, err)
    }

    /// Fail the next `op` on kind `K` with `err`.
    pub fn inject_on<K: StoredKind>(&self, op: Op, err: StoreError) -> StoreResult<()> {
        self.inject_for(op, Some(KindKey::of::<K>()), err)
    }

    fn inject_for(&self, op: Op, kind: Option<KindKey>, err: StoreError) -> StoreResult<()> {
        self.lock()?.faults.entry((op, kind)).or_default().push_back(err);
        Ok(())
    }

    /// Store raw JSON under `key`, bypassing decoding. Lets tests plant
    /// objects a typed client could never produce.
    pub fn put_raw<K: StoredKind>(&self, key: &ObjectKey, raw: Json) -> StoreResult<()> {
        let kind = self.scheme.require::<K>()?;
        let mut inner = self.lock()?;
        inner.objects.insert((kind, key.clone()), raw);
        Ok(())
    }

    /// Delete `key`, then garbage-collect every object whose owner references
    /// point at the deleted uid, transitively.
    pub fn delete<K: StoredKind>(&self, key: &ObjectKey) -> StoreResult<()> {
        let kind = self.scheme.require::<K>()?;
        let mut inner = self.lock()?;
        let mut pending = vec![(kind, key.clone())];
        let mut first = true;
        while let Some((kind, key)) = pending.pop() {
            let Some(raw) = inner.objects.remove(&(kind.clone(), key.clone())) else {
                if first {
                    return Err(StoreError::NotFound(format!("{kind} {key}")));
                }
                continue;
            };
            first = false;
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
            debug!(kind = %kind, key = %key, "deleted");
            if let Some(uid) = raw.pointer("/metadata/uid").and_then(Json::as_str) {
                pending.extend(
                    inner
                        .objects
                        .iter()
                        .filter(|(_, obj)| owned_by(obj, uid))
                        .map(|(id, _)| id.clone()),
                );
            }
            inner.publish(Notification { kind, key, labels: labels_of(&raw), deleted: true });
        }
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Transport("memory store lock poisoned".into()))
    }
}

impl Inner {
    fn take_fault(&mut self, op: Op, kind: &KindKey) -> Option<StoreError> {
        for slot in [(op, Some(kind.clone())), (op, None)] {
            if let Some(err) = self.faults.get_mut(&slot).and_then(VecDeque::pop_front) {
                return Some(err);
            }
        }
        None
    }

    fn next_rv(&mut self) -> String {
        self.last_rv += 1;
        self.last_rv.to_string()
    }

    fn publish(&mut self, n: Notification) {
        self.feeds.retain(|tx| !tx.is_closed());
        for tx in &self.feeds {
            if tx.try_send(n.clone()).is_err() {
                warn!(key = %n.key, "watch feed full; notification dropped");
            }
        }
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    async fn get<K: StoredKind>(&self, key: &ObjectKey) -> StoreResult<K> {
        let kind = self.scheme.require::<K>()?;
        let raw = {
            let mut inner = self.lock()?;
            if let Some(err) = inner.take_fault(Op::Get, &kind) {
                return Err(err);
            }
            inner.objects.get(&(kind.clone(), key.clone())).cloned()
        };
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let raw = raw.ok_or_else(|| StoreError::NotFound(format!("{kind} {key}")))?;
        decode(raw)
    }

    async fn create<K: StoredKind>(&self, obj: &K) -> StoreResult<K> {
        let kind = self.scheme.require::<K>()?;
        let key = key_of(obj)?;
        let mut inner = self.lock()?;
        if let Some(err) = inner.take_fault(Op::Create, &kind) {
            return Err(err);
        }
        let id = (kind.clone(), key.clone());
        if inner.objects.contains_key(&id) {
            return Err(StoreError::AlreadyExists(format!("{kind} {key}")));
        }
        let mut stored = obj.clone();
        let meta = stored.meta_mut();
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.resource_version = Some(inner.next_rv());
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        let raw = encode(&stored)?;
        // hand back what a later get would return
        let stored: K = decode(raw.clone())?;
        let labels = labels_of(&raw);
        inner.objects.insert(id, raw);
        self.counters.creates.fetch_add(1, Ordering::Relaxed);
        debug!(kind = %kind, key = %key, rv = ?stored.meta().resource_version, "created");
        inner.publish(Notification { kind, key, labels, deleted: false });
        Ok(stored)
    }

    async fn update<K: StoredKind>(&self, obj: &K) -> StoreResult<K> {
        let kind = self.scheme.require::<K>()?;
        let key = key_of(obj)?;
        let mut inner = self.lock()?;
        if let Some(err) = inner.take_fault(Op::Update, &kind) {
            return Err(err);
        }
        let id = (kind.clone(), key.clone());
        let current = inner
            .objects
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("{kind} {key}")))?;
        let current_rv = current.pointer("/metadata/resourceVersion").and_then(Json::as_str).map(str::to_string);
        let current_uid = current.pointer("/metadata/uid").and_then(Json::as_str).map(str::to_string);
        let created = current.pointer("/metadata/creationTimestamp").cloned();
        if let Some(rv) = obj.meta().resource_version.as_deref() {
            if current_rv.as_deref() != Some(rv) {
                return Err(StoreError::Conflict(format!(
                    "{kind} {key}: resourceVersion {rv} is stale (current {})",
                    current_rv.unwrap_or_default()
                )));
            }
        }
        let mut stored = obj.clone();
        let meta = stored.meta_mut();
        meta.uid = current_uid;
        meta.resource_version = Some(inner.next_rv());
        meta.creation_timestamp = match created {
            Some(ts) => serde_json::from_value(ts).map_err(|e| StoreError::Decode(e.to_string()))?,
            None => None,
        };
        let raw = encode(&stored)?;
        let stored: K = decode(raw.clone())?;
        let labels = labels_of(&raw);
        inner.objects.insert(id, raw);
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        debug!(kind = %kind, key = %key, rv = ?stored.meta().resource_version, "updated");
        inner.publish(Notification { kind, key, labels, deleted: false });
        Ok(stored)
    }

    async fn watch(&self) -> StoreResult<mpsc::Receiver<Notification>> {
        let (tx, rx) = mpsc::channel(self.feed_cap);
        self.lock()?.feeds.push(tx);
        Ok(rx)
    }
}

fn encode<K: StoredKind>(obj: &K) -> StoreResult<Json> {
    serde_json::to_value(obj).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn decode<K: StoredKind>(raw: Json) -> StoreResult<K> {
    serde_json::from_value(raw).map_err(|e| StoreError::Decode(e.to_string()))
}

fn labels_of(raw: &Json) -> BTreeMap<String, String> {
    raw.pointer("/metadata/labels")
        .and_then(Json::as_object)
        .map(|m| m.iter().filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string()))).collect())
        .unwrap_or_default()
}

fn owned_by(raw: &Json, uid: &str) -> bool {
    raw.pointer("/metadata/ownerReferences")
        .and_then(Json::as_array)
        .is_some_and(|refs| refs.iter().any(|r| r.get("uid").and_then(Json::as_str) == Some(uid)))
}
