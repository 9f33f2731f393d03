use crate::{
    config::FlocConfig,
    error::Error,
    event::{EventBus, LockEvent, ReclaimReason},
    lease::{Lease, LockMode, ResourceId},
    queue::{WaitQueue, Waiter},
    session::SessionTracker,
    store::LeaseStore,
    time::Clock,
    Result, SessionId,
};
use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// What to take out of a resource's holder set when settling it.
enum Removal<'a> {
    /// Expiry sweep only.
    None,
    /// Voluntary release of one lease.
    Release(&'a Lease),
    /// Voluntary release of everything a disconnecting session holds.
    Disconnect(SessionId),
    /// Forced reclaim of everything a dead session held.
    SessionDied(SessionId),
}

#[derive(Debug, Default)]
struct Settlement {
    released: usize,
    reclaimed: usize,
    granted: usize,
}

/// The central coordinator.
///
/// All mutation of one resource's lease state and wait queue happens under
/// that resource's queue mutex, so grants, releases and the background sweep
/// appear atomic to each other per resource while unrelated resources never
/// contend. The lease store stays the single source of truth: the wait queue
/// and session tracker are in-memory indexes, rebuildable via [`recover`].
///
/// [`recover`]: LockManager::recover
#[derive(Debug)]
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: FlocConfig,
    sessions: SessionTracker,
    resources: DashMap<ResourceId, Arc<ResourceEntry>>,
    events: EventBus,
    next_seq: AtomicU64,
}

#[derive(Debug, Default)]
struct ResourceEntry {
    waiters: Mutex<WaitQueue>,
}

impl LockManager {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>, config: FlocConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            store,
            clock,
            config,
            sessions: SessionTracker::new(),
            resources: DashMap::new(),
            events,
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &FlocConfig {
        &self.config
    }

    /// Subscribe to the lock lifecycle event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    /// Register a new client session.
    pub fn connect(&self) -> SessionId {
        let session = SessionId::new();
        self.sessions.register(session, self.clock.now());
        debug!("session {session} connected");
        session
    }

    /// Refresh a session's liveness. Fails once the session has been marked
    /// dead; the client must reconnect and re-acquire.
    pub fn heartbeat(&self, session: SessionId) -> Result<()> {
        self.sessions.heartbeat(session, self.clock.now())
    }

    /// Orderly shutdown of a session: every held lease is released and
    /// waiters are serviced.
    pub async fn disconnect(&self, session: SessionId) -> Result<()> {
        let Some(state) = self.sessions.remove(session) else {
            return Err(Error::Invalid(format!("unknown or dead session {session}")));
        };
        debug!(
            "session {session} disconnecting, releasing {} leases",
            state.held.len()
        );
        for resource in state.held {
            let entry = self.entry(&resource);
            let mut queue = entry.waiters.lock().await;
            self.settle(&resource, &mut queue, &Removal::Disconnect(session))
                .await?;
        }
        Ok(())
    }

    /// Acquire a lock on `resource`, waiting up to `timeout` if it is
    /// currently held in an incompatible mode.
    ///
    /// A zero timeout fails fast without ever enqueueing a waiter. The
    /// returned lease must be renewed before `lease_duration` elapses or it
    /// will be reclaimed.
    pub async fn acquire(
        &self,
        resource: &str,
        session: SessionId,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Lease> {
        let resource = ResourceId::new(resource)?;
        if !self.sessions.is_alive(session) {
            return Err(Error::Invalid(format!("unknown or dead session {session}")));
        }

        let entry = self.entry(&resource);
        let (seq, mut rx) = {
            let mut queue = entry.waiters.lock().await;

            // Whoever reaches a resource first also reclaims whatever lapsed
            // on it, so nobody waits behind a dead holder until the sweep.
            let outcome = self.settle(&resource, &mut queue, &Removal::None).await?;
            if outcome.granted > 0 {
                debug!("woke {} parked waiters on {resource}", outcome.granted);
            }

            if queue.is_empty() {
                if let Some(lease) = self.try_grant(&resource, session, mode).await? {
                    return Ok(lease);
                }
            }

            if timeout.is_zero() {
                return Err(Error::TimedOut(timeout));
            }

            let (tx, rx) = oneshot::channel();
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            queue.enqueue(Waiter {
                seq,
                session,
                mode,
                grant: tx,
            });
            debug!("session {session} parked on {resource} ({mode:?}, seq {seq})");
            (seq, rx)
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(lease)) => Ok(lease),
            Ok(Err(_)) => Err(Error::Unavailable(
                "coordinator dropped the pending grant".to_string(),
            )),
            Err(_) => {
                let mut queue = entry.waiters.lock().await;
                if queue.remove(seq).is_some() {
                    return Err(Error::TimedOut(timeout));
                }
                drop(queue);
                // Our entry is gone: a grant was recorded before the removal,
                // and removal is authoritative only while the entry exists.
                match rx.try_recv() {
                    Ok(lease) => Ok(lease),
                    Err(_) => Err(Error::TimedOut(timeout)),
                }
            }
        }
    }

    /// Extend a held lease by the configured lease duration.
    pub async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let entry = self.entry(&lease.resource);
        let _queue = entry.waiters.lock().await;
        loop {
            let mut rec = self.store.get(&lease.resource).await?.unwrap_or_default();
            let expected = rec.version;
            let now = self.clock.now();

            let expired = Err(Error::Expired {
                resource: lease.resource.to_string(),
            });
            let Some(held) = rec
                .leases
                .iter_mut()
                .find(|held| held.holder == lease.holder && held.token == lease.token)
            else {
                return expired;
            };
            if held.is_expired(now) {
                // Lapsed but not yet swept; the sweep will reclaim it.
                return expired;
            }

            held.expires_at = now + self.lease_ttl();
            let renewed = held.clone();
            match self.store.put(&lease.resource, rec, expected).await {
                Ok(()) => {
                    debug!(
                        "renewed lease on {} for session {} (token {})",
                        lease.resource, lease.holder, lease.token
                    );
                    return Ok(renewed);
                }
                Err(Error::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Voluntarily give a lease back and wake whoever is next in line.
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        let entry = self.entry(&lease.resource);
        let mut queue = entry.waiters.lock().await;
        let outcome = self
            .settle(&lease.resource, &mut queue, &Removal::Release(lease))
            .await?;
        if outcome.released == 0 {
            debug!(
                "release of {} (token {}): lease already gone",
                lease.resource, lease.token
            );
        }
        Ok(())
    }

    /// Force-release every lease past its expiry and service the queues.
    ///
    /// Invoked by the background sweep; safe to call at any time. A resource
    /// whose store write fails is logged and retried next sweep.
    pub async fn reclaim_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut reclaimed = 0;
        for (resource, rec) in self.store.scan().await? {
            if !rec.leases.iter().any(|lease| lease.is_expired(now)) {
                continue;
            }
            let entry = self.entry(&resource);
            let mut queue = entry.waiters.lock().await;
            match self.settle(&resource, &mut queue, &Removal::None).await {
                Ok(outcome) => reclaimed += outcome.reclaimed,
                Err(e) => warn!("reclamation of {resource} failed: {e}, retrying next sweep"),
            }
        }
        if reclaimed > 0 {
            info!("reclaimed {reclaimed} expired leases");
        }
        Ok(reclaimed)
    }

    /// Age out sessions that missed their heartbeats and reclaim everything
    /// they held.
    pub async fn sweep_sessions(&self) -> Result<usize> {
        let now = self.clock.now();
        let timeout = chrono_duration(self.config.session_timeout);
        let mut died = 0;
        for session in self.sessions.expired(now, timeout) {
            let Some(state) = self.sessions.remove(session) else {
                continue;
            };
            info!(
                "session {session} missed heartbeats, reclaiming {} leases",
                state.held.len()
            );
            self.events.emit(LockEvent::SessionDied { session });
            for resource in state.held {
                let entry = self.entry(&resource);
                let mut queue = entry.waiters.lock().await;
                if let Err(e) = self
                    .settle(&resource, &mut queue, &Removal::SessionDied(session))
                    .await
                {
                    warn!(
                        "reclaim of {resource} after death of {session} failed: {e}, \
                         retrying next sweep"
                    );
                }
            }
            died += 1;
        }
        Ok(died)
    }

    /// Rebuild the session index from the lease store after a restart.
    ///
    /// Recovered sessions start with a fresh heartbeat; holders that are
    /// really gone simply never heartbeat and age out as usual. Queued
    /// requests are not durable and are lost: clients re-request.
    pub async fn recover(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut recovered = 0;
        for (resource, rec) in self.store.scan().await? {
            for lease in &rec.leases {
                if lease.is_expired(now) {
                    continue;
                }
                if !self.sessions.is_alive(lease.holder) {
                    self.sessions.register(lease.holder, now);
                    recovered += 1;
                }
                self.sessions.add_lease(lease.holder, &resource);
            }
        }
        if recovered > 0 {
            info!("recovered {recovered} sessions from the lease store");
        }
        Ok(recovered)
    }

    /// Run the periodic reclamation sweep until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.config.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if let Err(e) = manager.reclaim_expired().await {
                    warn!("reclamation sweep failed: {e}, retrying next sweep");
                }
                if let Err(e) = manager.sweep_sessions().await {
                    warn!("session sweep failed: {e}, retrying next sweep");
                }
            }
        })
    }

    fn entry(&self, resource: &ResourceId) -> Arc<ResourceEntry> {
        self.resources
            .entry(resource.clone())
            .or_default()
            .value()
            .clone()
    }

    fn lease_ttl(&self) -> ChronoDuration {
        chrono_duration(self.config.lease_duration)
    }

    /// Grant immediately if the resource is free or compatible. Never called
    /// while earlier waiters are queued.
    async fn try_grant(
        &self,
        resource: &ResourceId,
        session: SessionId,
        mode: LockMode,
    ) -> Result<Option<Lease>> {
        loop {
            let mut rec = self.store.get(resource).await?.unwrap_or_default();
            let expected = rec.version;
            let now = self.clock.now();

            let reclaimed = rec.strip_expired(now);
            if !rec.accepts(mode) {
                return Ok(None);
            }

            let lease = rec.mint(resource, session, mode, now + self.lease_ttl());
            match self.store.put(resource, rec, expected).await {
                Ok(()) => {
                    for stale in &reclaimed {
                        self.sessions.remove_lease(stale.holder, resource);
                        self.events.emit(LockEvent::Reclaimed {
                            resource: resource.clone(),
                            session: stale.holder,
                            token: stale.token,
                            reason: ReclaimReason::Expired,
                        });
                    }
                    self.sessions.add_lease(session, resource);
                    self.events.emit(LockEvent::Granted {
                        resource: resource.clone(),
                        session,
                        mode,
                        token: lease.token,
                    });
                    debug!(
                        "granted {mode:?} on {resource} to session {session} (token {})",
                        lease.token
                    );
                    return Ok(Some(lease));
                }
                Err(Error::Conflict { .. }) => {
                    debug!("lease store moved under {resource}, retrying grant");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Settle one resource under its queue mutex: strip expired holders,
    /// apply `removal`, then grant the maximal compatible prefix of the wait
    /// queue. The store write is compare-and-swapped and retried on conflict;
    /// waiters are only drained and woken after the write lands, so a lost
    /// race loses nothing.
    async fn settle(
        &self,
        resource: &ResourceId,
        queue: &mut WaitQueue,
        removal: &Removal<'_>,
    ) -> Result<Settlement> {
        loop {
            let mut rec = self.store.get(resource).await?.unwrap_or_default();
            let expected = rec.version;
            let now = self.clock.now();

            let reclaimed = rec.strip_expired(now);
            let removed = match removal {
                Removal::None => Vec::new(),
                Removal::Release(lease) => rec.remove_lease(lease).into_iter().collect(),
                Removal::Disconnect(session) | Removal::SessionDied(session) => {
                    rec.remove_session(*session)
                }
            };

            queue.prune_abandoned();
            let grantable = queue.compatible_head(rec.active_mode());
            let mut granted = Vec::with_capacity(grantable);
            for waiter in queue.iter_head(grantable) {
                granted.push(rec.mint(resource, waiter.session, waiter.mode, now + self.lease_ttl()));
            }

            if reclaimed.is_empty() && removed.is_empty() && granted.is_empty() {
                return Ok(Settlement::default());
            }

            let write = if rec.leases.is_empty() {
                self.store.delete(resource, expected).await
            } else {
                self.store.put(resource, rec, expected).await
            };
            match write {
                Ok(()) => {}
                Err(Error::Conflict { .. }) => {
                    debug!("lease store moved under {resource}, retrying settlement");
                    continue;
                }
                Err(e) => return Err(e),
            }

            for stale in &reclaimed {
                self.sessions.remove_lease(stale.holder, resource);
                self.events.emit(LockEvent::Reclaimed {
                    resource: resource.clone(),
                    session: stale.holder,
                    token: stale.token,
                    reason: ReclaimReason::Expired,
                });
                info!(
                    "reclaimed expired lease on {resource} from session {} (token {})",
                    stale.holder, stale.token
                );
            }
            for gone in &removed {
                self.sessions.remove_lease(gone.holder, resource);
                match removal {
                    Removal::SessionDied(_) => self.events.emit(LockEvent::Reclaimed {
                        resource: resource.clone(),
                        session: gone.holder,
                        token: gone.token,
                        reason: ReclaimReason::SessionDied,
                    }),
                    _ => self.events.emit(LockEvent::Released {
                        resource: resource.clone(),
                        session: gone.holder,
                        token: gone.token,
                    }),
                }
            }

            // The record is durable; now wake the winners. Sends happen under
            // the queue mutex, so a timing-out waiter that finds its entry
            // gone is guaranteed to find its lease in the channel.
            let waiters = queue.drain_head(granted.len());
            for (waiter, lease) in waiters.into_iter().zip(granted.iter()) {
                self.sessions.add_lease(waiter.session, resource);
                self.events.emit(LockEvent::Granted {
                    resource: resource.clone(),
                    session: waiter.session,
                    mode: waiter.mode,
                    token: lease.token,
                });
                debug!(
                    "granted {:?} on {resource} to parked session {} (token {})",
                    waiter.mode, waiter.session, lease.token
                );
                if waiter.grant.send(lease.clone()).is_err() {
                    debug!(
                        "waiter on {resource} vanished before its grant, \
                         lease (token {}) will lapse",
                        lease.token
                    );
                }
            }

            return Ok(Settlement {
                released: removed.len(),
                reclaimed: reclaimed.len(),
                granted: granted.len(),
            });
        }
    }
}

fn chrono_duration(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::seconds(30))
}
