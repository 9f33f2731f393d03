use floc::{
    lease::{FencingToken, LockMode},
    store::{FileLeaseStore, LeaseStore},
    test_utils::{fast_config, init_tracing, manager_over},
    time::ManualClock,
};
use floc::manager::LockManager;
use std::{sync::Arc, time::Duration};

#[tokio::test]
async fn fencing_tokens_survive_a_coordinator_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leases.bin");
    let clock = Arc::new(ManualClock::starting_now());

    let before_restart = {
        let store = Arc::new(FileLeaseStore::open(&path).unwrap());
        let manager = manager_over(store, clock.clone());
        let a = manager.connect();

        let lease = manager
            .acquire("/data/reportX", a, LockMode::Exclusive, Duration::ZERO)
            .await
            .unwrap();
        manager.release(&lease).await.unwrap();
        lease.token
    };

    // A new process over the same file must never reuse a token.
    let store = Arc::new(FileLeaseStore::open(&path).unwrap());
    let manager = manager_over(store, clock);
    let b = manager.connect();
    let lease = manager
        .acquire("/data/reportX", b, LockMode::Exclusive, Duration::ZERO)
        .await
        .unwrap();
    assert!(lease.token.is_valid_after(before_restart));
    assert_eq!(lease.token, FencingToken(2));
}

#[tokio::test]
async fn recover_rebuilds_the_session_index_from_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leases.bin");
    let clock = Arc::new(ManualClock::starting_now());

    let (survivor, held) = {
        let store = Arc::new(FileLeaseStore::open(&path).unwrap());
        let manager = manager_over(store, clock.clone());
        let a = manager.connect();
        let held = manager
            .acquire("/data/live", a, LockMode::Exclusive, Duration::ZERO)
            .await
            .unwrap();
        (a, held)
    };

    // Restart: queued requests are gone, but active leases are not.
    let store = Arc::new(FileLeaseStore::open(&path).unwrap());
    let manager = manager_over(store.clone(), clock.clone());
    assert_eq!(manager.recover().await.unwrap(), 1);

    // The surviving client keeps heartbeating and renewing as before.
    manager.heartbeat(survivor).unwrap();
    let renewed = manager.renew(&held).await.unwrap();
    assert_eq!(renewed.token, held.token);

    // If it instead goes silent, the usual session sweep reclaims it.
    clock.advance(chrono::Duration::seconds(16));
    assert_eq!(manager.sweep_sessions().await.unwrap(), 1);
    let rec = store
        .get(&floc::lease::ResourceId::new("/data/live").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(rec.leases.is_empty());
    assert_eq!(rec.last_token, held.token);
}

#[tokio::test]
async fn expired_leases_are_not_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leases.bin");
    let clock = Arc::new(ManualClock::starting_now());

    {
        let store = Arc::new(FileLeaseStore::open(&path).unwrap());
        let manager = manager_over(store, clock.clone());
        let a = manager.connect();
        manager
            .acquire("/data/stale", a, LockMode::Exclusive, Duration::ZERO)
            .await
            .unwrap();
    }

    clock.advance(chrono::Duration::seconds(31));
    let store = Arc::new(FileLeaseStore::open(&path).unwrap());
    let manager = Arc::new(LockManager::new(store, clock, fast_config()));
    assert_eq!(manager.recover().await.unwrap(), 0);
}
