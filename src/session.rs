use crate::{
    error::Error,
    lease::ResourceId,
    time::Timestamp,
    Result, SessionId,
};
use chrono::Duration;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SessionState {
    pub last_heartbeat: Timestamp,
    pub held: HashSet<ResourceId>,
}

/// Binds each connected client to the set of leases it holds and ages out
/// sessions that stop heartbeating.
///
/// Purely an in-memory index over the lease store: after a restart it is
/// rebuilt from the store's active leases plus live heartbeats.
#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: DashMap<SessionId, SessionState>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: SessionId, now: Timestamp) {
        self.sessions.insert(
            session,
            SessionState {
                last_heartbeat: now,
                held: HashSet::new(),
            },
        );
    }

    /// Refresh a session's liveness. A session that was already marked dead
    /// (or never connected) cannot heartbeat; it must reconnect.
    pub fn heartbeat(&self, session: SessionId, now: Timestamp) -> Result<()> {
        match self.sessions.get_mut(&session) {
            Some(mut state) => {
                state.last_heartbeat = now;
                Ok(())
            }
            None => Err(Error::Invalid(format!("unknown or dead session {session}"))),
        }
    }

    pub fn is_alive(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }

    pub fn add_lease(&self, session: SessionId, resource: &ResourceId) {
        if let Some(mut state) = self.sessions.get_mut(&session) {
            state.held.insert(resource.clone());
        }
    }

    pub fn remove_lease(&self, session: SessionId, resource: &ResourceId) {
        if let Some(mut state) = self.sessions.get_mut(&session) {
            state.held.remove(resource);
        }
    }

    /// Resources the session currently holds leases on.
    pub fn held(&self, session: SessionId) -> Vec<ResourceId> {
        self.sessions
            .get(&session)
            .map(|state| state.held.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove the session entirely, returning what it held.
    pub fn remove(&self, session: SessionId) -> Option<SessionState> {
        let removed = self.sessions.remove(&session).map(|(_, state)| state);
        if removed.is_some() {
            debug!("session {session} removed from tracker");
        }
        removed
    }

    /// Sessions whose last heartbeat is older than `timeout`.
    pub fn expired(&self, now: Timestamp, timeout: Duration) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| now.signed_duration_since(entry.value().last_heartbeat) > timeout)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn heartbeat_keeps_a_session_alive() {
        let tracker = SessionTracker::new();
        let session = SessionId::new();
        let t0 = Utc::now();

        tracker.register(session, t0);
        assert!(tracker.expired(t0 + Duration::seconds(10), Duration::seconds(15)).is_empty());

        tracker.heartbeat(session, t0 + Duration::seconds(10)).unwrap();
        assert!(tracker
            .expired(t0 + Duration::seconds(20), Duration::seconds(15))
            .is_empty());

        let dead = tracker.expired(t0 + Duration::seconds(26), Duration::seconds(15));
        assert_eq!(dead, vec![session]);
    }

    #[test]
    fn dead_session_cannot_heartbeat() {
        let tracker = SessionTracker::new();
        let session = SessionId::new();
        tracker.register(session, Utc::now());
        tracker.remove(session);

        assert!(tracker.heartbeat(session, Utc::now()).is_err());
        assert!(!tracker.is_alive(session));
    }

    #[test]
    fn held_set_follows_lease_bookkeeping() {
        let tracker = SessionTracker::new();
        let session = SessionId::new();
        let resource = ResourceId::new("/data/a").unwrap();
        tracker.register(session, Utc::now());

        tracker.add_lease(session, &resource);
        assert_eq!(tracker.held(session), vec![resource.clone()]);

        tracker.remove_lease(session, &resource);
        assert!(tracker.held(session).is_empty());
    }
}
