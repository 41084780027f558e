use std::time::Duration;

/// Engine timing and capacity settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiescence window before a document is materialized (default: 1s)
    pub debounce: Duration,
    /// Interval between compaction sweeps (default: 60s)
    pub compaction_interval: Duration,
    /// Loaded documents untouched this long are evicted after a sweep (default: 10min)
    pub idle_eviction: Duration,
    /// Broadcast channel capacity per document room (default: 256)
    pub broadcast_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(60),
            idle_eviction: Duration::from_secs(10 * 60),
            broadcast_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            compaction_interval: Duration::from_millis(200),
            idle_eviction: Duration::from_secs(60),
            broadcast_capacity: 64,
        }
    }
}
