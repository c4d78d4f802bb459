//! Store-and-forward queue
//!
//! Envelopes that could not be handed to any link wait here, indexed by the
//! device they should reach. Entries addressed to nobody in particular wait
//! under [`QueueTarget::AnyPeer`] and go out on the first link that appears.
//!
//! ```text
//! send(to: C)  ──► no link to C ──► queue[C]
//!                                     │
//!   handshake from C / periodic sweep ┘──► transmit ──► ok: drop entry
//!                                                └──► fail: attempts += 1
//! ```
//!
//! Entries older than the maximum age, or that failed the retry ceiling
//! number of times, are purged on the next sweep.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::types::DeviceId;

/// Who a queued envelope is waiting for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueTarget {
    /// A specific device; flushed only when it is directly linked
    Device(DeviceId),
    /// Any device at all; flushed on the first available link
    AnyPeer,
}

impl fmt::Display for QueueTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueTarget::Device(id) => write!(f, "{}", id),
            QueueTarget::AnyPeer => write!(f, "*"),
        }
    }
}

/// A queued envelope awaiting a link
#[derive(Debug, Clone, PartialEq)]
pub struct PendingQueueEntry {
    pub envelope: Envelope,
    /// When the envelope was queued (Unix millis)
    pub enqueued_at: i64,
    /// Failed transmissions so far
    pub attempts: u32,
}

/// In-memory store-and-forward queue
#[derive(Debug)]
pub struct StoreForwardQueue {
    pending: HashMap<QueueTarget, Vec<PendingQueueEntry>>,
    max_age_ms: i64,
    retry_ceiling: u32,
}

impl StoreForwardQueue {
    pub fn new(max_age_ms: i64, retry_ceiling: u32) -> Self {
        Self {
            pending: HashMap::new(),
            max_age_ms,
            retry_ceiling,
        }
    }

    /// Queue an envelope; returns false if it already waits for this target
    pub fn enqueue(&mut self, envelope: Envelope, target: QueueTarget, now: i64) -> bool {
        let entries = self.pending.entry(target.clone()).or_default();
        if entries.iter().any(|e| e.envelope.id == envelope.id) {
            return false;
        }
        tracing::info!(
            envelope_id = %envelope.id,
            target = %target,
            "Queued envelope for store-and-forward"
        );
        entries.push(PendingQueueEntry {
            envelope,
            enqueued_at: now,
            attempts: 0,
        });
        true
    }

    /// Put back an entry after a failed flush
    pub fn requeue(&mut self, target: QueueTarget, entry: PendingQueueEntry) {
        let entries = self.pending.entry(target).or_default();
        if !entries.iter().any(|e| e.envelope.id == entry.envelope.id) {
            entries.push(entry);
        }
    }

    /// Take every entry waiting for a target
    pub fn take(&mut self, target: &QueueTarget) -> Vec<PendingQueueEntry> {
        self.pending.remove(target).unwrap_or_default()
    }

    /// Look at the entries for a target without removing them
    pub fn get(&self, target: &QueueTarget) -> Vec<PendingQueueEntry> {
        self.pending.get(target).cloned().unwrap_or_default()
    }

    pub fn has_pending(&self, target: &QueueTarget) -> bool {
        self.pending
            .get(target)
            .map(|entries| !entries.is_empty())
            .unwrap_or(false)
    }

    /// Targets with at least one entry
    pub fn targets(&self) -> Vec<QueueTarget> {
        self.pending
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(target, _)| target.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(|v| v.len()).sum()
    }

    /// Purge entries past the maximum age or the retry ceiling
    ///
    /// Returns the number of entries removed.
    pub fn expire(&mut self, now: i64) -> usize {
        let cutoff = now - self.max_age_ms;
        let ceiling = self.retry_ceiling;
        let mut removed = 0;

        for entries in self.pending.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.enqueued_at > cutoff && e.attempts < ceiling);
            removed += before - entries.len();
        }
        self.pending.retain(|_, entries| !entries.is_empty());

        if removed > 0 {
            tracing::debug!(removed, "Expired queued envelopes");
        }
        removed
    }
}
