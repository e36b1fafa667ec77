use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use lantern_core::{ChangeEvent, EventSource, ResourceId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Caller-facing change-event stream whose source can be replaced while it is being read.
///
/// A forwarding task copies events from the current source into one outward
/// channel. Replacing the source stops the old forwarder (and its source)
/// before the new one delivers anything. The stream completes when it is
/// stopped or when its current source runs dry.
#[derive(Debug)]
pub struct SubscriberStream {
    resource: ResourceId,
    rx: mpsc::Receiver<ChangeEvent>,
    control: Arc<StreamControl>,
}

#[derive(Debug)]
struct StreamControl {
    state: Mutex<ControlState>,
}

#[derive(Debug)]
struct ControlState {
    stopped: bool,
    generation: u64,
    tx: Option<mpsc::Sender<ChangeEvent>>,
    forwarder: Option<Forwarder>,
}

#[derive(Debug)]
struct Forwarder {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SubscriberStream {
    pub fn new(resource: ResourceId, capacity: usize, source: Box<dyn EventSource>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let control = Arc::new(StreamControl {
            state: Mutex::new(ControlState { stopped: false, generation: 0, tx: Some(tx), forwarder: None }),
        });
        control.rebind(source);
        Self { resource, rx, control }
    }

    pub fn resource(&self) -> &ResourceId { &self.resource }

    pub async fn recv(&mut self) -> Option<ChangeEvent> { self.rx.recv().await }

    /// Idempotent. Stops the current source and completes the stream.
    pub fn stop(&mut self) {
        self.control.stop();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    pub fn is_stopped(&self) -> bool { self.control.lock().stopped }

    pub(crate) fn swap_handle(&self) -> SwapHandle { SwapHandle(self.control.clone()) }
}

impl Drop for SubscriberStream {
    fn drop(&mut self) {
        self.control.stop();
    }
}

impl futures::Stream for SubscriberStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChangeEvent>> { self.rx.poll_recv(cx) }
}

/// Controller-side handle that rebinds a [`SubscriberStream`]'s source.
#[derive(Debug, Clone)]
pub(crate) struct SwapHandle(Arc<StreamControl>);

impl SwapHandle {
    /// Replace the source. Returns false (and stops `source`) once the stream is stopped or complete.
    pub(crate) fn swap(&self, source: Box<dyn EventSource>) -> bool { self.0.rebind(source) }

    /// Still accepting a source: neither stopped nor complete.
    pub(crate) fn is_live(&self) -> bool {
        let st = self.0.lock();
        !st.stopped && st.tx.is_some()
    }

    pub(crate) fn stop(&self) { self.0.stop() }
}

impl StreamControl {
    fn lock(&self) -> MutexGuard<'_, ControlState> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn rebind(self: &Arc<Self>, mut source: Box<dyn EventSource>) -> bool {
        let mut st = self.lock();
        let live = if st.stopped { None } else { st.tx.clone() };
        let Some(tx) = live else {
            drop(st);
            source.stop();
            return false;
        };
        st.generation += 1;
        let previous = st.forwarder.take().map(|f| {
            f.cancel.cancel();
            f.task
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward(self.clone(), st.generation, previous, source, tx, cancel.clone()));
        st.forwarder = Some(Forwarder { cancel, task });
        true
    }

    fn stop(&self) {
        let mut st = self.lock();
        if st.stopped {
            return;
        }
        st.stopped = true;
        st.tx = None;
        if let Some(f) = st.forwarder.take() {
            f.cancel.cancel();
        }
    }

    /// The source of `generation` ran dry; complete the stream unless it was swapped meanwhile.
    fn finish(&self, generation: u64) {
        let mut st = self.lock();
        if st.generation == generation {
            st.tx = None;
            st.forwarder = None;
        }
    }
}

async fn forward(
    control: Arc<StreamControl>,
    generation: u64,
    previous: Option<JoinHandle<()>>,
    mut source: Box<dyn EventSource>,
    tx: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
) {
    if let Some(prev) = previous {
        let _ = prev.await;
    }
    let mut forwarded = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            ev = source.next_event() => ev,
        };
        let Some(ev) = next else {
            control.finish(generation);
            break;
        };
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            r = tx.send(ev) => r.is_ok(),
        };
        if !sent {
            break;
        }
        forwarded += 1;
    }
    source.stop();
    debug!(generation, forwarded, "informer: stream source released");
}
