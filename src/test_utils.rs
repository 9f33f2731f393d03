use crate::{
    config::FlocConfig,
    manager::LockManager,
    store::{LeaseStore, MemoryLeaseStore},
    time::ManualClock,
};
use std::{sync::Arc, time::Duration};

/// Initialize tracing for tests; repeated calls are fine.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Config with short intervals so tests settle quickly.
pub fn fast_config() -> FlocConfig {
    FlocConfig {
        lease_duration: Duration::from_secs(30),
        session_timeout: Duration::from_secs(15),
        sweep_interval: Duration::from_millis(20),
        event_capacity: 64,
    }
}

/// A coordinator on a fresh in-memory store, with a manually driven clock.
pub fn manual_manager() -> (Arc<LockManager>, Arc<ManualClock>, Arc<MemoryLeaseStore>) {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryLeaseStore::new());
    let manager = Arc::new(LockManager::new(store.clone(), clock.clone(), fast_config()));
    (manager, clock, store)
}

/// A coordinator over a caller-supplied store, sharing the given clock.
pub fn manager_over(
    store: Arc<dyn LeaseStore>,
    clock: Arc<ManualClock>,
) -> Arc<LockManager> {
    Arc::new(LockManager::new(store, clock, fast_config()))
}
