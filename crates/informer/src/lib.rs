//! Lantern informer: primes an in-memory store for every watchable resource,
//! keeps it current from upstream watches and serves reads from it once synced.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lantern_core::{
    Error, EventKind, EventSource, ListOptions, Object, ObjectKey, ResourceId, ResourceMeta, Result, Transport,
    UpstreamWatch, WatchStopper,
};
use lantern_store::MemoryStore;
use metrics::{counter, gauge, histogram};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod config;
mod stream;

pub use config::InformerConfig;
pub use stream::SubscriberStream;

use stream::SwapHandle;

/// A subscriber created before its resource synced, waiting to be moved onto the store.
struct Registration {
    options: ListOptions,
    handle: SwapHandle,
}

#[derive(Default)]
struct SyncState {
    synced: BTreeSet<ResourceId>,
    /// Upstream watch feeding the store, per synced resource.
    upstream: HashMap<ResourceId, WatchStopper>,
    pending: HashMap<ResourceId, Vec<Registration>>,
    relists: HashMap<ResourceId, JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    store: Arc<MemoryStore>,
    cfg: InformerConfig,
    permits: Arc<Semaphore>,
    state: Mutex<SyncState>,
    shutdown: CancellationToken,
}

/// Sync controller. Cheap to clone; clones share one store and one sync state.
#[derive(Clone)]
pub struct Informer {
    inner: Arc<Inner>,
}

async fn cancellable<T>(ctx: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Error::Cancelled),
        r = fut => r,
    }
}

impl Informer {
    pub fn new(transport: Arc<dyn Transport>, cfg: InformerConfig) -> Self {
        let store = Arc::new(MemoryStore::with_capacity(cfg.subscriber_capacity));
        let permits = Arc::new(Semaphore::new(cfg.max_workers.max(1)));
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                cfg,
                permits,
                state: Mutex::new(SyncState::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SyncState> { self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn config(&self) -> &InformerConfig { &self.inner.cfg }

    /// The backing store. Reads through it bypass the synced check.
    pub fn store(&self) -> &MemoryStore { &self.inner.store }

    /// Discover the catalog and prime every watchable resource, at most
    /// `max_workers` at a time. The first primer failure cancels the rest and
    /// is returned; whatever was already synced stays until [`Informer::stop`].
    pub async fn start(&self, ctx: &CancellationToken) -> Result<()> {
        let t0 = Instant::now();
        let catalog = cancellable(ctx, self.inner.transport.resources()).await?;
        let watchable: Vec<ResourceId> = catalog.iter().filter(|m| m.is_watchable()).map(|m| m.id.clone()).collect();
        info!(
            resources = catalog.len(),
            watchable = watchable.len(),
            workers = self.inner.cfg.max_workers,
            "informer: discovery ok"
        );

        let run = ctx.child_token();
        let mut primers = JoinSet::new();
        for res in watchable {
            let this = self.clone();
            let run = run.clone();
            primers.spawn(async move {
                let shutdown = this.inner.shutdown.clone();
                let primed = async {
                    let permits = this.inner.permits.clone();
                    let _permit = tokio::select! {
                        biased;
                        _ = run.cancelled() => return Err(Error::Cancelled),
                        p = permits.acquire_owned() => match p {
                            Ok(p) => p,
                            Err(_) => return Err(Error::Cancelled),
                        },
                    };
                    this.prime(&run, &res).await
                };
                cancellable(&shutdown, primed).await
            });
        }

        let mut first: Option<Error> = None;
        while let Some(joined) = primers.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(Error::Internal(format!("primer task: {e}"))));
            match (outcome, &first) {
                (Ok(()), _) => {}
                (Err(e), None) => {
                    run.cancel();
                    first = Some(e);
                }
                (Err(e), Some(_)) => debug!(error = %e, "informer: sibling primer ended"),
            }
        }
        match first {
            Some(e) => {
                warn!(error = %e, kind = ?e.kind(), took_ms = %t0.elapsed().as_millis(), "informer: start failed");
                Err(e)
            }
            None => {
                info!(synced = self.state().synced.len(), took_ms = %t0.elapsed().as_millis(), "informer: start ok");
                Ok(())
            }
        }
    }

    async fn prime(&self, ctx: &CancellationToken, res: &ResourceId) -> Result<()> {
        let t0 = Instant::now();
        let opts = ListOptions::default();
        let primed = async {
            let objects = cancellable(ctx, self.inner.transport.list(res, &opts)).await?;
            let count = objects.len();
            for o in objects {
                self.inner.store.update(res, o).await;
            }
            let watch = cancellable(ctx, self.inner.transport.watch(res, &opts)).await?;
            Ok::<_, Error>((count, watch))
        }
        .await;
        let (count, watch) = match primed {
            Ok(v) => v,
            Err(e) => {
                if !matches!(e, Error::Cancelled) {
                    counter!("informer_primer_failures_total", 1u64);
                }
                warn!(resource = %res, error = %e, "informer: primer failed");
                return Err(e);
            }
        };

        let stopper = watch.stopper();
        tokio::spawn(drain(self.inner.store.clone(), res.clone(), watch));
        let migrated = self.mark_synced(res, stopper)?;

        histogram!("informer_primer_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(resource = %res, objects = count, migrated, took_ms = %t0.elapsed().as_millis(), "informer: primer ok");
        Ok(())
    }

    /// Flip `res` to synced and move its pre-sync subscribers onto the store, as one step
    /// with respect to [`Informer::watch`].
    fn mark_synced(&self, res: &ResourceId, stopper: WatchStopper) -> Result<usize> {
        let mut st = self.state();
        if self.inner.shutdown.is_cancelled() {
            stopper.stop();
            return Err(Error::Cancelled);
        }
        st.synced.insert(res.clone());
        if let Some(previous) = st.upstream.insert(res.clone(), stopper) {
            previous.stop();
        }
        let mut migrated = 0;
        for reg in st.pending.remove(res).unwrap_or_default() {
            if !reg.handle.is_live() {
                continue;
            }
            let sub = self.inner.store.watch(res, reg.options);
            if reg.handle.swap(Box::new(sub)) {
                migrated += 1;
            }
        }
        if let Some(every) = self.inner.cfg.relist_interval {
            let task = tokio::spawn(relist(self.inner.transport.clone(), self.inner.store.clone(), res.clone(), every));
            if let Some(previous) = st.relists.insert(res.clone(), task) {
                previous.abort();
            }
        }
        gauge!("informer_synced_resources", st.synced.len() as f64);
        Ok(migrated)
    }

    /// Stop every upstream watch, relist timer and subscriber, and forget what was synced.
    pub fn stop(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        self.inner.permits.close();
        let (upstream, relists, pending) = {
            let mut st = self.state();
            st.synced.clear();
            (std::mem::take(&mut st.upstream), std::mem::take(&mut st.relists), std::mem::take(&mut st.pending))
        };
        for stopper in upstream.values() {
            stopper.stop();
        }
        for task in relists.values() {
            task.abort();
        }
        for reg in pending.values().flatten() {
            reg.handle.stop();
        }
        self.inner.store.close_subscribers();
        gauge!("informer_synced_resources", 0.0);
        info!(upstream = upstream.len(), relists = relists.len(), "informer: stopped");
        Ok(())
    }

    /// Served from the store when `res` is synced, otherwise from the transport.
    pub async fn list(&self, ctx: &CancellationToken, res: &ResourceId, opts: &ListOptions) -> Result<Vec<Object>> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.is_synced(res) {
            return Ok(self.inner.store.list(res, opts));
        }
        cancellable(ctx, self.inner.transport.list(res, opts)).await
    }

    /// A stream of changes to `res`. Before `res` syncs it is fed by an upstream
    /// watch and moves onto the store when the primer finishes.
    pub async fn watch(&self, ctx: &CancellationToken, res: &ResourceId, opts: ListOptions) -> Result<SubscriberStream> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let cap = self.inner.cfg.subscriber_capacity;
        if self.is_synced(res) {
            return Ok(self.store_stream(res, opts));
        }
        let upstream = cancellable(ctx, self.inner.transport.watch(res, &opts)).await?;
        let mut st = self.state();
        if st.synced.contains(res) {
            drop(st);
            let mut upstream = upstream;
            upstream.stop();
            debug!(resource = %res, "informer: synced while opening upstream watch");
            return Ok(self.store_stream(res, opts));
        }
        let stream = SubscriberStream::new(res.clone(), cap, Box::new(upstream));
        let regs = st.pending.entry(res.clone()).or_default();
        regs.retain(|r| r.handle.is_live());
        regs.push(Registration { options: opts, handle: stream.swap_handle() });
        debug!(resource = %res, "informer: upstream-backed watch registered");
        Ok(stream)
    }

    fn store_stream(&self, res: &ResourceId, opts: ListOptions) -> SubscriberStream {
        let sub = self.inner.store.watch(res, opts);
        SubscriberStream::new(res.clone(), self.inner.cfg.subscriber_capacity, Box::new(sub))
    }

    pub async fn resources(&self) -> Result<Vec<ResourceMeta>> { self.inner.transport.resources().await }

    pub fn is_synced(&self, res: &ResourceId) -> bool { self.state().synced.contains(res) }

    pub fn synced_resources(&self) -> Vec<ResourceId> { self.state().synced.iter().cloned().collect() }

    /// Live pre-sync subscribers of `res`.
    pub fn pending_watches(&self, res: &ResourceId) -> usize {
        self.state().pending.get(res).map_or(0, |regs| regs.iter().filter(|r| r.handle.is_live()).count())
    }
}

/// Apply one upstream watch to the store until it ends or is stopped.
async fn drain(store: Arc<MemoryStore>, res: ResourceId, mut watch: UpstreamWatch) {
    let mut applied = 0u64;
    while let Some(ev) = watch.next_event().await {
        match ev.kind {
            EventKind::Added | EventKind::Modified => store.update(&res, ev.object).await,
            EventKind::Deleted => store.delete(&res, ev.object).await,
            other => {
                debug!(resource = %res, kind = %other, "informer: discarding upstream event");
                continue;
            }
        }
        applied += 1;
    }
    info!(resource = %res, applied, stopped = watch.is_stopped(), "informer: upstream watch ended");
}

async fn relist(transport: Arc<dyn Transport>, store: Arc<MemoryStore>, res: ResourceId, every: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match transport.list(&res, &ListOptions::default()).await {
            Ok(listed) => {
                let (updated, deleted) = reconcile(&store, &res, listed).await;
                debug!(resource = %res, updated, deleted, "informer: relist ok");
            }
            Err(e) => warn!(resource = %res, error = %e, "informer: relist failed"),
        }
    }
}

fn version_of(o: &Object) -> Option<u64> { o.resource_version().and_then(|v| v.parse().ok()) }

/// Whether `stored` already holds resource version `listed` or a later one.
fn at_or_past(stored: &Object, listed: Option<&str>) -> bool {
    match (stored.resource_version(), listed) {
        (Some(s), Some(l)) if s == l => true,
        (Some(s), Some(l)) => matches!((s.parse::<u64>(), l.parse::<u64>()), (Ok(s), Ok(l)) if s > l),
        _ => false,
    }
}

/// Bring the store's view of `res` in line with `listed` without rolling anything back.
///
/// A listed object is written only when the stored copy is absent or older.
/// A stored key missing from the listing is removed unless its resource version
/// is newer than every listed one. Each check runs against the copy stored at
/// write time, so a drainer racing the relist wins.
async fn reconcile(store: &MemoryStore, res: &ResourceId, listed: Vec<Object>) -> (usize, usize) {
    let horizon = listed.iter().filter_map(version_of).max();
    let keep: HashSet<ObjectKey> = listed.iter().filter_map(Object::key).collect();
    let missing: Vec<Object> = store
        .list(res, &ListOptions::default())
        .into_iter()
        .filter(|o| o.key().is_some_and(|k| !keep.contains(&k)))
        .collect();
    let (mut updated, mut deleted) = (0, 0);
    for o in listed {
        let rv = o.resource_version().map(str::to_owned);
        if store.update_if(res, o, |stored| !stored.is_some_and(|s| at_or_past(s, rv.as_deref()))).await {
            updated += 1;
        }
    }
    for o in missing {
        let newer = |stored: &Object| matches!((version_of(stored), horizon), (Some(v), Some(h)) if v > h);
        if store.delete_if(res, o, |stored| !newer(stored)).await {
            deleted += 1;
        }
    }
    (updated, deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(name: &str) -> Object { Object::new(json!({"metadata": {"name": name, "namespace": "ns1"}})) }

    #[tokio::test]
    async fn reconcile_matches_listing() {
        let store = MemoryStore::new();
        let res = ResourceId::new("", "v1", "pods");
        store.update(&res, obj("a")).await;
        store.update(&res, obj("b")).await;
        let (updated, deleted) = reconcile(&store, &res, vec![obj("b"), obj("c")]).await;
        assert_eq!((updated, deleted), (2, 1));
        let mut names: Vec<String> =
            store.list(&res, &ListOptions::default()).iter().filter_map(|o| o.name().map(String::from)).collect();
        names.sort();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn reconcile_to_empty_collapses_resource() {
        let store = MemoryStore::new();
        let res = ResourceId::new("", "v1", "pods");
        store.update(&res, obj("a")).await;
        reconcile(&store, &res, Vec::new()).await;
        assert!(store.resources().is_empty());
    }

    fn at(name: &str, rv: &str) -> Object {
        Object::new(json!({"metadata": {"name": name, "namespace": "ns1", "resourceVersion": rv}}))
    }

    fn rv(store: &MemoryStore, res: &ResourceId, name: &str) -> Option<String> {
        let key = at(name, "0").key()?;
        store.get(res, &key).and_then(|o| o.resource_version().map(String::from))
    }

    #[tokio::test]
    async fn reconcile_never_rolls_back_a_newer_copy() {
        let store = MemoryStore::new();
        let res = ResourceId::new("", "v1", "pods");
        store.update(&res, at("b", "5")).await;
        assert_eq!(reconcile(&store, &res, vec![at("b", "3")]).await, (0, 0));
        assert_eq!(rv(&store, &res, "b").as_deref(), Some("5"));

        assert_eq!(reconcile(&store, &res, vec![at("b", "8")]).await, (1, 0));
        assert_eq!(rv(&store, &res, "b").as_deref(), Some("8"));
    }

    #[tokio::test]
    async fn reconcile_leaves_unchanged_objects_silent() {
        let store = MemoryStore::new();
        let res = ResourceId::new("", "v1", "pods");
        store.update(&res, at("a", "4")).await;
        let mut sub = store.watch(&res, ListOptions::default());
        assert_eq!(reconcile(&store, &res, vec![at("a", "4"), at("c", "6")]).await, (1, 0));
        let ev = sub.try_recv().unwrap();
        assert_eq!((ev.kind, ev.object.name()), (EventKind::Modified, Some("c")));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn reconcile_keeps_keys_written_after_the_listing() {
        let store = MemoryStore::new();
        let res = ResourceId::new("", "v1", "pods");
        store.update(&res, at("a", "2")).await;
        store.update(&res, at("d", "9")).await;
        assert_eq!(reconcile(&store, &res, vec![at("b", "5")]).await, (1, 1));
        assert_eq!(rv(&store, &res, "a"), None);
        assert_eq!(rv(&store, &res, "d").as_deref(), Some("9"));
        assert_eq!(rv(&store, &res, "b").as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn stopped_presync_watches_are_not_kept() {
        let res = ResourceId::new("", "v1", "pods");
        let t = Arc::new(lantern_core::mock::MockTransport::new().with_watchable(res.clone(), "Pod", true));
        let inf = Informer::new(t, InformerConfig::default());
        let ctx = CancellationToken::new();
        let stored = |inf: &Informer| inf.state().pending.get(&res).map_or(0, Vec::len);

        for _ in 0..50 {
            let mut s = inf.watch(&ctx, &res, ListOptions::default()).await.unwrap();
            s.stop();
        }
        assert_eq!(inf.pending_watches(&res), 0);
        assert!(stored(&inf) <= 1);

        let live = inf.watch(&ctx, &res, ListOptions::default()).await.unwrap();
        assert_eq!(stored(&inf), 1);
        drop(live);
        let _kept = inf.watch(&ctx, &res, ListOptions::default()).await.unwrap();
        assert_eq!(stored(&inf), 1);
        assert_eq!(inf.pending_watches(&res), 1);
    }
}
