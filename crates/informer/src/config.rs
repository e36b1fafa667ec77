use std::num::NonZeroUsize;
use std::time::Duration;

use lantern_store::DEFAULT_SUBSCRIBER_CAPACITY;

const _: () = assert!(DEFAULT_SUBSCRIBER_CAPACITY > 0, "subscriber channels must be bounded above zero");

/// Tuning for [`crate::Informer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformerConfig {
    /// Primers allowed to run at once.
    pub max_workers: usize,
    /// Bound of every store subscriber channel and every outward stream channel.
    pub subscriber_capacity: usize,
    /// Periodic relist of each synced resource; `None` disables it.
    pub relist_interval: Option<Duration>,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            relist_interval: None,
        }
    }
}

impl InformerConfig {
    /// Defaults overridden by `LANTERN_MAX_WORKERS`, `LANTERN_QUEUE_CAP` and `LANTERN_RELIST_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let workers = std::env::var("LANTERN_MAX_WORKERS").ok().and_then(|s| s.parse::<usize>().ok());
        let cap = std::env::var("LANTERN_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok());
        let relist = std::env::var("LANTERN_RELIST_SECS").ok().and_then(|s| s.parse::<u64>().ok());
        Self {
            max_workers: workers.unwrap_or(d.max_workers).max(1),
            subscriber_capacity: cap.unwrap_or(d.subscriber_capacity).max(1),
            relist_interval: relist.filter(|s| *s > 0).map(Duration::from_secs),
        }
    }

    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n.max(1);
        self
    }

    pub fn with_relist_interval(mut self, every: Duration) -> Self {
        self.relist_interval = (!every.is_zero()).then_some(every);
        self
    }

    pub fn with_subscriber_capacity(mut self, cap: usize) -> Self {
        self.subscriber_capacity = cap.max(1);
        self
    }
}
