use std::time::Duration;

pub const DEFAULT_RECONCILE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_TIMEOUT_THRESHOLD: Duration = Duration::from_secs(120);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Timing knobs shared by every session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Settle time between a terminal push event and the reconciliation fetch.
    pub reconcile_delay: Duration,
    pub timeout_threshold: Duration,
    pub tick_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            reconcile_delay: DEFAULT_RECONCILE_DELAY,
            timeout_threshold: DEFAULT_TIMEOUT_THRESHOLD,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}
