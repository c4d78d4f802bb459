//! Processed-envelope set
//!
//! Every envelope id this device has originated, delivered or relayed is
//! remembered for a bounded window. A second arrival inside the window is a
//! duplicate and is dropped before any delivery or relay.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::EnvelopeId;

/// Envelope ids seen recently, with the instant they were first seen
#[derive(Debug)]
pub struct ProcessedIdSet {
    seen: HashMap<EnvelopeId, Instant>,
    window: Duration,
}

impl ProcessedIdSet {
    /// Create an empty set that forgets ids after `window`
    pub fn new(window: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            window,
        }
    }

    /// Record an id; returns false when it was already present
    pub fn insert(&mut self, id: EnvelopeId, now: Instant) -> bool {
        match self.seen.entry(id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    pub fn contains(&self, id: &EnvelopeId) -> bool {
        self.seen.contains_key(id)
    }

    /// Forget ids older than the window; returns how many were dropped
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.seen.len();
        let window = self.window;
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < window);
        let removed = before - self.seen.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.seen.len(), "Swept processed ids");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_insert_is_duplicate() {
        let mut set = ProcessedIdSet::new(Duration::from_secs(60));
        let now = Instant::now();
        assert!(set.insert(EnvelopeId::from("x"), now));
        assert!(!set.insert(EnvelopeId::from("x"), now));
        assert!(set.contains(&EnvelopeId::from("x")));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_sweep_forgets_old_ids() {
        let mut set = ProcessedIdSet::new(Duration::from_secs(10));
        let start = Instant::now();
        set.insert(EnvelopeId::from("old"), start);
        set.insert(EnvelopeId::from("new"), start + Duration::from_secs(8));

        assert_eq!(set.sweep(start + Duration::from_secs(11)), 1);
        assert!(!set.contains(&EnvelopeId::from("old")));
        assert!(set.contains(&EnvelopeId::from("new")));

        // Forgotten ids are accepted again
        assert!(set.insert(EnvelopeId::from("old"), start + Duration::from_secs(11)));
    }
}
