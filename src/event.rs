use crate::{
    lease::{FencingToken, LockMode, ResourceId},
    SessionId,
};
use tokio::sync::broadcast;
use tracing::trace;

/// Why a lease was forcibly taken back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimReason {
    /// The lease lapsed without renewal.
    Expired,
    /// The holding session missed its heartbeats.
    SessionDied,
}

/// Lock lifecycle events, published for observability by the surrounding
/// gateway. `Reclaimed` is distinct from `Released`: the original holder was
/// never notified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Granted {
        resource: ResourceId,
        session: SessionId,
        mode: LockMode,
        token: FencingToken,
    },
    Released {
        resource: ResourceId,
        session: SessionId,
        token: FencingToken,
    },
    Reclaimed {
        resource: ResourceId,
        session: SessionId,
        token: FencingToken,
        reason: ReclaimReason,
    },
    SessionDied {
        session: SessionId,
    },
}

/// Broadcast fan-out of [`LockEvent`]s. Slow subscribers lag rather than
/// block the coordinator.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<LockEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LockEvent) {
        trace!("event: {event:?}");
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}
