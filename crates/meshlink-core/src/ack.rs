//! Acknowledgment tracking for envelopes that ask for delivery confirmation
//!
//! The originator keeps every `requires_ack` envelope here until the target's
//! ack comes back. Retries back off exponentially: the first resend happens
//! after the ack timeout, later ones after `2^attempt` seconds capped at the
//! configured ceiling. Each retry carries its attempt number so relays that
//! saw an earlier attempt forward it again. Once the retry budget is spent
//! the envelope is reported as failed and forgotten.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::envelope::Envelope;
use crate::types::EnvelopeId;

#[derive(Debug, Clone)]
struct PendingAck {
    envelope: Envelope,
    last_attempt: Instant,
    attempt: u32,
}

/// What to do with an envelope whose ack is overdue
#[derive(Debug, Clone, PartialEq)]
pub enum AckDecision {
    /// Send the envelope again
    Retry(Envelope),
    /// Give up on it
    Failed(EnvelopeId),
}

/// Envelopes waiting for their ack
#[derive(Debug)]
pub struct AckTracker {
    pending: HashMap<EnvelopeId, PendingAck>,
    timeout: Duration,
    max_retries: u32,
    backoff_cap: Duration,
}

impl AckTracker {
    pub fn new(timeout: Duration, max_retries: u32, backoff_cap: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
            max_retries,
            backoff_cap,
        }
    }

    /// Start waiting for an ack
    pub fn track(&mut self, envelope: Envelope, now: Instant) {
        self.pending.insert(
            envelope.id.clone(),
            PendingAck {
                envelope,
                last_attempt: now,
                attempt: 0,
            },
        );
    }

    /// Record an ack; returns false for unknown or already confirmed ids
    pub fn acknowledge(&mut self, id: &EnvelopeId) -> bool {
        self.pending.remove(id).is_some()
    }

    pub fn is_pending(&self, id: &EnvelopeId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wait before the next attempt, given how many retries were already made
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        backoff(self.timeout, self.backoff_cap, attempt)
    }

    /// Collect the retries and failures that are due at `now`
    pub fn check(&mut self, now: Instant) -> Vec<AckDecision> {
        let mut decisions = Vec::new();
        let mut failed = Vec::new();
        let (timeout, cap) = (self.timeout, self.backoff_cap);

        for (id, pending) in self.pending.iter_mut() {
            let wait = backoff(timeout, cap, pending.attempt);
            if now.saturating_duration_since(pending.last_attempt) < wait {
                continue;
            }
            if pending.attempt >= self.max_retries {
                failed.push(id.clone());
                continue;
            }
            pending.attempt += 1;
            pending.last_attempt = now;
            let mut retry = pending.envelope.clone();
            retry.attempt = pending.attempt;
            decisions.push(AckDecision::Retry(retry));
        }

        for id in failed {
            self.pending.remove(&id);
            tracing::warn!(envelope_id = %id, "Envelope was never acknowledged");
            decisions.push(AckDecision::Failed(id));
        }
        decisions
    }
}

fn backoff(timeout: Duration, cap: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return timeout;
    }
    Duration::from_secs(1u64 << attempt.min(20)).min(cap)
}
