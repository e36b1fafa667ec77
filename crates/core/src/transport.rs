use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{ChangeEvent, ListOptions, Object, ResourceId, ResourceMeta, Result};

/// Client for the cluster API.
///
/// Cancellation is by dropping the returned future; callers that hold a
/// cancellation token race it against the call.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Catalog discovery.
    async fn resources(&self) -> Result<Vec<ResourceMeta>>;

    async fn list(&self, res: &ResourceId, opts: &ListOptions) -> Result<Vec<Object>>;

    async fn watch(&self, res: &ResourceId, opts: &ListOptions) -> Result<UpstreamWatch>;
}

/// Pull side of a change-event stream.
#[async_trait]
pub trait EventSource: Send {
    /// Next event, or `None` once the source is exhausted or stopped.
    async fn next_event(&mut self) -> Option<ChangeEvent>;

    /// Idempotent. After `stop` the sequence completes.
    fn stop(&mut self);
}

/// A transport-side watch. Events are produced through the paired [`WatchFeed`].
///
/// Stopping (or dropping) the watch completes its sequence whether or not the
/// producer has noticed yet.
#[derive(Debug)]
pub struct UpstreamWatch {
    resource: ResourceId,
    rx: mpsc::Receiver<ChangeEvent>,
    stop: CancellationToken,
}

impl UpstreamWatch {
    pub fn channel(resource: ResourceId, capacity: usize) -> (WatchFeed, UpstreamWatch) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stop = CancellationToken::new();
        let feed = WatchFeed { resource: resource.clone(), tx, stop: stop.clone() };
        (feed, UpstreamWatch { resource, rx, stop })
    }

    pub fn resource(&self) -> &ResourceId { &self.resource }

    /// Handle that stops this watch from elsewhere (e.g. after the watch moved into a drainer).
    pub fn stopper(&self) -> WatchStopper { WatchStopper(self.stop.clone()) }

    pub fn is_stopped(&self) -> bool { self.stop.is_cancelled() }
}

#[async_trait]
impl EventSource for UpstreamWatch {
    async fn next_event(&mut self) -> Option<ChangeEvent> {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => {
                self.rx.close();
                None
            }
            ev = self.rx.recv() => ev,
        }
    }

    fn stop(&mut self) {
        self.stop.cancel();
        self.rx.close();
    }
}

impl Drop for UpstreamWatch {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct WatchStopper(CancellationToken);

impl WatchStopper {
    pub fn stop(&self) { self.0.cancel(); }

    pub fn is_stopped(&self) -> bool { self.0.is_cancelled() }
}

/// Producer side of an [`UpstreamWatch`].
#[derive(Debug, Clone)]
pub struct WatchFeed {
    resource: ResourceId,
    tx: mpsc::Sender<ChangeEvent>,
    stop: CancellationToken,
}

impl WatchFeed {
    pub fn resource(&self) -> &ResourceId { &self.resource }

    /// Deliver one event, waiting for room. Returns false once the watch is stopped or gone.
    pub async fn send(&self, event: ChangeEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    /// Resolves when the consumer stops or drops the watch.
    pub async fn stopped(&self) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    pub fn is_stopped(&self) -> bool { self.stop.is_cancelled() || self.tx.is_closed() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;
    use serde_json::json;
    use std::time::Duration;

    fn event(name: &str) -> ChangeEvent {
        ChangeEvent::new(EventKind::Added, ResourceId::new("", "v1", "pods"), Object::new(json!({"metadata": {"name": name}})))
    }

    #[tokio::test]
    async fn events_flow_until_producer_drops() {
        let (feed, mut watch) = UpstreamWatch::channel(ResourceId::new("", "v1", "pods"), 4);
        assert!(feed.send(event("a")).await);
        drop(feed);
        assert_eq!(watch.next_event().await.map(|e| e.object.name().map(String::from)), Some(Some("a".into())));
        assert!(watch.next_event().await.is_none());
    }

    #[tokio::test]
    async fn stop_completes_sequence_even_with_live_producer() {
        let (feed, mut watch) = UpstreamWatch::channel(ResourceId::new("", "v1", "pods"), 4);
        let stopper = watch.stopper();
        stopper.stop();
        assert!(stopper.is_stopped());
        let next = tokio::time::timeout(Duration::from_secs(1), watch.next_event()).await.unwrap();
        assert!(next.is_none());
        assert!(feed.is_stopped());
        assert!(!feed.send(event("late")).await);
    }

    #[tokio::test]
    async fn dropping_the_watch_wakes_the_producer() {
        let (feed, watch) = UpstreamWatch::channel(ResourceId::new("", "v1", "pods"), 1);
        drop(watch);
        tokio::time::timeout(Duration::from_secs(1), feed.stopped()).await.unwrap();
    }
}
