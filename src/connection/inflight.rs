//! Per-connection inflight message tracking with expiry timers.
//!
//! Each delivered, not-yet-finalized message gets a deadline. `FIN`/`REQ`
//! remove it; `TOUCH` resets it; if it fires untouched, the entry is simply
//! dropped — `nsqd` requeues it independently, so nothing client-side needs
//! to happen (see the connection state machine's inflight lifecycle).

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::message::MessageId;

/// Tracks inflight message deadlines for one connection.
#[derive(Debug, Default)]
pub struct InflightTracker {
    entries: HashMap<MessageId, Instant>,
}

impl InflightTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly delivered message, expiring after `timeout`.
    pub fn insert(&mut self, id: MessageId, timeout: Duration) {
        self.entries.insert(id, Instant::now() + timeout);
    }

    /// Reset a message's deadline to `timeout` from now. No-op if the id is
    /// no longer tracked (already finished, requeued, or expired).
    pub fn touch(&mut self, id: &MessageId, timeout: Duration) {
        if let Some(deadline) = self.entries.get_mut(id) {
            *deadline = Instant::now() + timeout;
        }
    }

    /// Stop tracking a message (on FIN or REQ). Returns true if it was
    /// still tracked.
    pub fn remove(&mut self, id: &MessageId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Number of messages currently inflight.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no messages are inflight.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The earliest deadline across all tracked messages, if any — the
    /// connection task sleeps until this instant in its select loop.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().min().copied()
    }

    /// Drop every entry whose deadline has passed, returning their ids
    /// purely for logging; no action is required for them.
    pub fn expire_due(&mut self) -> Vec<MessageId> {
        let now = Instant::now();
        let expired: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }
}
