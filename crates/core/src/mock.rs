//! In-memory [`Transport`] for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{Error, ListOptions, Object, ResourceId, ResourceMeta, Result, Transport, UpstreamWatch, WatchFeed};

/// Serves a fixed catalog and object set. Every watch it opens hands its
/// producer side to the test through [`MockTransport::feeds`].
pub struct MockTransport {
    state: Mutex<MockState>,
    watch_capacity: usize,
}

#[derive(Default)]
struct MockState {
    catalog: Vec<ResourceMeta>,
    objects: HashMap<ResourceId, Vec<Object>>,
    discovery_error: Option<String>,
    list_errors: HashMap<ResourceId, String>,
    watch_errors: HashMap<ResourceId, String>,
    hung_lists: HashSet<ResourceId>,
    held_watches: HashMap<ResourceId, Arc<Notify>>,
    list_calls: Vec<(ResourceId, ListOptions)>,
    watches: Vec<(ResourceId, ListOptions, WatchFeed)>,
}

impl Default for MockTransport {
    fn default() -> Self { Self { state: Mutex::new(MockState::default()), watch_capacity: 64 } }
}

impl MockTransport {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, MockState> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn with_resource(self, meta: ResourceMeta) -> Self {
        self.state().catalog.push(meta);
        self
    }

    /// Adds a resource supporting list and watch.
    pub fn with_watchable(self, id: ResourceId, kind: &str, namespaced: bool) -> Self {
        self.with_resource(ResourceMeta::new(id, kind, ["get", "list", "watch"], namespaced))
    }

    pub fn with_objects(self, res: ResourceId, objects: Vec<Object>) -> Self {
        self.set_objects(res, objects);
        self
    }

    /// Replaces what subsequent lists of `res` return.
    pub fn set_objects(&self, res: ResourceId, objects: Vec<Object>) { self.state().objects.insert(res, objects); }

    pub fn fail_discovery(&self, msg: &str) { self.state().discovery_error = Some(msg.to_string()); }

    pub fn fail_list(&self, res: &ResourceId, msg: &str) { self.state().list_errors.insert(res.clone(), msg.to_string()); }

    pub fn fail_watch(&self, res: &ResourceId, msg: &str) { self.state().watch_errors.insert(res.clone(), msg.to_string()); }

    /// Lists of `res` never complete.
    pub fn hang_list(&self, res: &ResourceId) { self.state().hung_lists.insert(res.clone()); }

    /// The next watch on `res` is opened (its feed shows up in [`MockTransport::feeds`])
    /// but the call only returns once the returned gate is notified.
    pub fn hold_next_watch(&self, res: &ResourceId) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().held_watches.insert(res.clone(), gate.clone());
        gate
    }

    pub fn list_calls(&self) -> Vec<(ResourceId, ListOptions)> { self.state().list_calls.clone() }

    pub fn watch_calls(&self) -> Vec<(ResourceId, ListOptions)> {
        self.state().watches.iter().map(|(r, o, _)| (r.clone(), o.clone())).collect()
    }

    /// Drop the producer side of every watch on `res`; those watches then run dry.
    pub fn close_feeds(&self, res: &ResourceId) { self.state().watches.retain(|(r, _, _)| r != res); }

    /// Producer handles of every watch opened on `res`, oldest first.
    pub fn feeds(&self, res: &ResourceId) -> Vec<WatchFeed> {
        self.state().watches.iter().filter(|(r, _, _)| r == res).map(|(_, _, f)| f.clone()).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn resources(&self) -> Result<Vec<ResourceMeta>> {
        let st = self.state();
        match &st.discovery_error {
            Some(msg) => Err(Error::discovery(anyhow::anyhow!("{msg}"))),
            None => Ok(st.catalog.clone()),
        }
    }

    async fn list(&self, res: &ResourceId, opts: &ListOptions) -> Result<Vec<Object>> {
        let hung = {
            let mut st = self.state();
            st.list_calls.push((res.clone(), opts.clone()));
            if let Some(msg) = st.list_errors.get(res) {
                return Err(Error::list(res, anyhow::anyhow!("{msg}")));
            }
            st.hung_lists.contains(res)
        };
        if hung {
            std::future::pending::<()>().await;
        }
        let st = self.state();
        let objects = st.objects.get(res).map(|v| v.iter().filter(|o| opts.matches(o)).cloned().collect());
        Ok(objects.unwrap_or_default())
    }

    async fn watch(&self, res: &ResourceId, opts: &ListOptions) -> Result<UpstreamWatch> {
        let (watch, held) = {
            let mut st = self.state();
            if let Some(msg) = st.watch_errors.get(res) {
                return Err(Error::watch(res, anyhow::anyhow!("{msg}")));
            }
            let (feed, watch) = UpstreamWatch::channel(res.clone(), self.watch_capacity);
            st.watches.push((res.clone(), opts.clone(), feed));
            (watch, st.held_watches.remove(res))
        };
        if let Some(gate) = held {
            gate.notified().await;
        }
        Ok(watch)
    }
}
