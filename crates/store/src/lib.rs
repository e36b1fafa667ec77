//! Lantern store: per-resource object maps and change-event fanout to subscribers.

#![forbid(unsafe_code)]

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use lantern_core::{ChangeEvent, EventKind, EventSource, ListOptions, Object, ObjectKey, ResourceId};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Events buffered per subscriber. A full subscriber blocks the mutating call until it reads.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 128;

type ResourceData = FxHashMap<ObjectKey, Object>;

struct SubscriberRecord {
    resource: ResourceId,
    options: ListOptions,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct StoreInner {
    data: FxHashMap<ResourceId, ResourceData>,
    subscribers: FxHashMap<Uuid, SubscriberRecord>,
}

impl StoreInner {
    fn targets(&self, res: &ResourceId, obj: &Object) -> Vec<(Uuid, mpsc::Sender<ChangeEvent>)> {
        self.subscribers
            .iter()
            .filter(|(_, s)| &s.resource == res && s.options.matches(obj))
            .map(|(id, s)| (*id, s.tx.clone()))
            .collect()
    }

    fn prune_closed(&mut self) { self.subscribers.retain(|_, s| !s.tx.is_closed()); }
}

/// In-memory store keyed by `ResourceId` then `ObjectKey`.
///
/// Mutations are serialized: each one applies its change and snapshots the
/// matching subscribers under the write lock, then delivers outside the lock
/// before the next mutation starts. Every subscriber therefore sees events in
/// apply order, and a subscriber installed by [`MemoryStore::watch`] sees
/// exactly the mutations applied after it returned.
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
    order: tokio::sync::Mutex<()>,
    capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY) }
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { inner: RwLock::new(StoreInner::default()), order: tokio::sync::Mutex::new(()), capacity: capacity.max(1) }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> { self.inner.read().unwrap_or_else(PoisonError::into_inner) }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> { self.inner.write().unwrap_or_else(PoisonError::into_inner) }

    /// Insert or overwrite `obj` and emit `Modified` to matching subscribers.
    pub async fn update(&self, res: &ResourceId, obj: Object) { self.update_if(res, obj, |_| true).await; }

    /// [`MemoryStore::update`] gated on the currently stored copy (`None` when the key is absent).
    /// The check and the write happen as one mutation. Returns whether `obj` was written.
    pub async fn update_if(&self, res: &ResourceId, obj: Object, accept: impl FnOnce(Option<&Object>) -> bool) -> bool {
        let Some(key) = obj.key() else {
            warn!(resource = %res, "store: update dropped, object has no name");
            return false;
        };
        let _order = self.order.lock().await;
        let targets = {
            let mut inner = self.write();
            if !accept(inner.data.get(res).and_then(|m| m.get(&key))) {
                return false;
            }
            inner.data.entry(res.clone()).or_default().insert(key, obj.clone());
            inner.targets(res, &obj)
        };
        self.deliver(targets, ChangeEvent::new(EventKind::Modified, res.clone(), obj)).await;
        true
    }

    /// Remove `obj`'s key and emit `Deleted`. Deleting an absent key changes nothing and emits nothing.
    pub async fn delete(&self, res: &ResourceId, obj: Object) { self.delete_if(res, obj, |_| true).await; }

    /// [`MemoryStore::delete`] gated on the currently stored copy. Returns whether a key was removed.
    pub async fn delete_if(&self, res: &ResourceId, obj: Object, accept: impl FnOnce(&Object) -> bool) -> bool {
        let Some(key) = obj.key() else {
            warn!(resource = %res, "store: delete dropped, object has no name");
            return false;
        };
        let _order = self.order.lock().await;
        let targets = {
            let mut inner = self.write();
            let Some(objects) = inner.data.get_mut(res) else { return false };
            if !objects.get(&key).is_some_and(accept) {
                return false;
            }
            objects.remove(&key);
            if objects.is_empty() {
                inner.data.remove(res);
            }
            inner.targets(res, &obj)
        };
        self.deliver(targets, ChangeEvent::new(EventKind::Deleted, res.clone(), obj)).await;
        true
    }

    async fn deliver(&self, targets: Vec<(Uuid, mpsc::Sender<ChangeEvent>)>, event: ChangeEvent) {
        if targets.is_empty() {
            return;
        }
        let mut delivered = 0u64;
        let mut gone = Vec::new();
        for (id, tx) in targets {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            } else {
                gone.push(id);
            }
        }
        counter!("store_events_delivered_total", delivered);
        if !gone.is_empty() {
            let mut inner = self.write();
            for id in &gone {
                inner.subscribers.remove(id);
            }
            gauge!("store_subscribers", inner.subscribers.len() as f64);
            debug!(pruned = gone.len(), "store: dropped stopped subscribers");
        }
    }

    /// Copy of the objects under `res` matching `opts`. Unknown resources yield an empty list.
    pub fn list(&self, res: &ResourceId, opts: &ListOptions) -> Vec<Object> {
        let inner = self.read();
        match inner.data.get(res) {
            Some(objects) => objects.values().filter(|o| opts.matches(o)).cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn get(&self, res: &ResourceId, key: &ObjectKey) -> Option<Object> {
        self.read().data.get(res).and_then(|m| m.get(key)).cloned()
    }

    /// Install a subscriber. No snapshot is replayed; call [`MemoryStore::list`] first when one is needed.
    pub fn watch(&self, res: &ResourceId, opts: ListOptions) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        let mut inner = self.write();
        inner.prune_closed();
        inner.subscribers.insert(id, SubscriberRecord { resource: res.clone(), options: opts, tx });
        gauge!("store_subscribers", inner.subscribers.len() as f64);
        debug!(resource = %res, %id, "store: subscriber added");
        Subscription { id, resource: res.clone(), rx }
    }

    /// Resources currently holding at least one object, in key order.
    pub fn resources(&self) -> Vec<ResourceId> {
        let mut out: Vec<ResourceId> = self.read().data.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn len(&self, res: &ResourceId) -> usize { self.read().data.get(res).map_or(0, |m| m.len()) }

    /// Live subscribers (stopped ones not yet pruned are not counted).
    pub fn subscriber_count(&self) -> usize { self.read().subscribers.values().filter(|s| !s.tx.is_closed()).count() }

    /// Release every subscriber; their streams complete after draining what was already queued.
    pub fn close_subscribers(&self) {
        let mut inner = self.write();
        let n = inner.subscribers.len();
        inner.subscribers.clear();
        gauge!("store_subscribers", 0.0);
        debug!(closed = n, "store: subscribers closed");
    }
}

/// A store subscriber: the receiving end of one fanout channel.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    resource: ResourceId,
    rx: mpsc::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn id(&self) -> Uuid { self.id }

    pub fn resource(&self) -> &ResourceId { &self.resource }

    pub async fn recv(&mut self) -> Option<ChangeEvent> { self.rx.recv().await }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> { self.rx.try_recv().ok() }

    /// Idempotent. Discards anything still queued, so the next read yields `None`.
    pub fn stop(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

#[async_trait]
impl EventSource for Subscription {
    async fn next_event(&mut self) -> Option<ChangeEvent> { self.recv().await }

    fn stop(&mut self) { Subscription::stop(self) }
}
