use crate::lease::DEFAULT_LEASE_DURATION;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coordinator tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlocConfig {
    /// How long a freshly granted or renewed lease stays valid.
    pub lease_duration: Duration,

    /// How long a session may go without a heartbeat before it is
    /// presumed dead and its leases reclaimed.
    pub session_timeout: Duration,

    /// Interval of the background reclamation sweep.
    pub sweep_interval: Duration,

    /// Buffer size of the lock lifecycle event stream.
    pub event_capacity: usize,
}

impl Default for FlocConfig {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            session_timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(1),
            event_capacity: 256,
        }
    }
}
