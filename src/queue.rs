use crate::{
    lease::{Lease, LockMode},
    SessionId,
};
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// One parked `acquire` call.
///
/// The waiter's task sleeps on the receiving half of `grant`; whichever
/// release or reclamation frees the resource sends the lease through it.
#[derive(Debug)]
pub struct Waiter {
    pub seq: u64,
    pub session: SessionId,
    pub mode: LockMode,
    pub grant: oneshot::Sender<Lease>,
}

/// Per-resource FIFO of pending requests.
///
/// Entries are consumed strictly in enqueue order: a queued exclusive request
/// blocks every later shared request from jumping ahead, even while shared
/// holders are active.
#[derive(Debug, Default)]
pub struct WaitQueue {
    entries: VecDeque<Waiter>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn enqueue(&mut self, waiter: Waiter) {
        self.entries.push_back(waiter);
    }

    /// Number of entries at the head the manager may grant together given the
    /// currently active holder mode: one exclusive entry, or a run of
    /// consecutive shared entries bounded by the next exclusive entry.
    pub fn compatible_head(&self, active: Option<LockMode>) -> usize {
        match active {
            Some(LockMode::Exclusive) => 0,
            Some(LockMode::Shared) => self.shared_run(),
            None => match self.entries.front().map(|w| w.mode) {
                Some(LockMode::Exclusive) => 1,
                Some(LockMode::Shared) => self.shared_run(),
                None => 0,
            },
        }
    }

    fn shared_run(&self) -> usize {
        self.entries
            .iter()
            .take_while(|w| w.mode == LockMode::Shared)
            .count()
    }

    /// Peek at the first `n` entries without consuming them, so a grant that
    /// loses its store write can be recomputed with nothing lost.
    pub fn iter_head(&self, n: usize) -> impl Iterator<Item = &Waiter> {
        self.entries.iter().take(n)
    }

    /// Pop the first `n` entries for granting.
    pub fn drain_head(&mut self, n: usize) -> Vec<Waiter> {
        let n = n.min(self.entries.len());
        self.entries.drain(..n).collect()
    }

    /// Remove the entry with the given sequence number, e.g. when its
    /// `acquire` call timed out and gave up.
    pub fn remove(&mut self, seq: u64) -> Option<Waiter> {
        let idx = self.entries.iter().position(|w| w.seq == seq)?;
        self.entries.remove(idx)
    }

    /// Drop entries whose waiting task has gone away.
    pub fn prune_abandoned(&mut self) {
        self.entries.retain(|w| !w.grant.is_closed());
    }
}
