//! Keep-alive bookkeeping
//!
//! Each ping carries a sequence number that only ever grows, even across
//! sessions. A ping is settled exactly once: either its pong arrives, or it
//! expires and counts as one failure. Clearing the tracker on teardown makes
//! any pong still in flight from the old session a no-op.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct KeepAliveTracker {
    next_seq: u64,
    pending: BTreeMap<u64, Instant>,
    timeout: Duration,
    last_rtt: Option<Duration>,
}

impl KeepAliveTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_seq: 0,
            pending: BTreeMap::new(),
            timeout,
            last_rtt: None,
        }
    }

    /// Register a new outstanding ping and return its sequence number
    pub fn next_ping(&mut self, now: Instant) -> u64 {
        self.next_seq += 1;
        self.pending.insert(self.next_seq, now);
        self.next_seq
    }

    /// Settle a ping with its pong; `None` if unknown, expired or stale
    pub fn on_pong(&mut self, seq: u64, now: Instant) -> Option<Duration> {
        let sent = self.pending.remove(&seq)?;
        let rtt = now.saturating_duration_since(sent);
        self.last_rtt = Some(rtt);
        Some(rtt)
    }

    /// Settle one ping as timed out; false if it was already settled
    pub fn expire_one(&mut self, seq: u64) -> bool {
        self.pending.remove(&seq).is_some()
    }

    /// Settle every ping older than the timeout and return their sequences
    pub fn expire(&mut self, now: Instant) -> Vec<u64> {
        let timeout = self.timeout;
        let expired = self
            .pending
            .iter()
            .filter(|(_, sent)| now.saturating_duration_since(**sent) >= timeout)
            .map(|(seq, _)| *seq)
            .collect::<Vec<_>>();
        for seq in &expired {
            self.pending.remove(seq);
        }
        expired
    }

    /// Outstanding pings
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Drop every outstanding ping; sequence numbers keep growing
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
