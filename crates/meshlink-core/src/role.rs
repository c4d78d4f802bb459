//! Host/client role arbitration
//!
//! Two devices that discover each other at the same moment must not both
//! wait for the other to host, and should not both host either. Each device
//! decides independently:
//!
//! 1. An operator-forced role always wins.
//! 2. A previously joined host that is visible again is rejoined.
//! 3. With nobody around, host.
//! 4. Otherwise host with a probability that shrinks as the visible pool
//!    grows, and join the best candidate the rest of the time.
//!
//! The randomness breaks symmetry between devices running identical code.

use std::cmp::Ordering;
use std::collections::HashSet;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{ArbitrationConfig, HostWeights};
use crate::peers::PeerRecord;
use crate::types::{ForcedRole, TransportKind};

/// Outcome of one arbitration round
#[derive(Debug, Clone, PartialEq)]
pub enum RoleDecision {
    /// Create a group and accept clients
    Host,
    /// Connect to these peers in order until one accepts
    Client { candidates: Vec<PeerRecord> },
    /// Forced to client with nobody to join
    Wait,
}

/// Decides whether this device hosts or joins
pub struct RoleArbitrator {
    weights: HostWeights,
    rng: Mutex<StdRng>,
}

impl RoleArbitrator {
    pub fn new(config: &ArbitrationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            weights: config.weights.clone(),
            rng: Mutex::new(rng),
        }
    }

    /// Run one arbitration round
    ///
    /// `known_hosts` holds (transport, address) pairs of hosts this device
    /// joined before.
    pub fn decide(
        &self,
        forced: Option<ForcedRole>,
        peers: &[PeerRecord],
        known_hosts: &HashSet<(TransportKind, String)>,
    ) -> RoleDecision {
        let mut rng = self.rng.lock();
        decide_with(&self.weights, forced, peers, known_hosts, &mut *rng)
    }
}

fn is_known(peer: &PeerRecord, known_hosts: &HashSet<(TransportKind, String)>) -> bool {
    known_hosts.contains(&(peer.transport, peer.address.clone()))
}

/// Candidate ordering: known hosts, then hosting peers, then signal, then recency
fn rank(
    peers: &[PeerRecord],
    known_hosts: &HashSet<(TransportKind, String)>,
) -> Vec<PeerRecord> {
    let mut candidates = peers
        .iter()
        .filter(|p| p.available)
        .cloned()
        .collect::<Vec<_>>();
    candidates.sort_by(|a, b| {
        is_known(b, known_hosts)
            .cmp(&is_known(a, known_hosts))
            .then_with(|| b.is_host.cmp(&a.is_host))
            .then_with(|| match (a.signal, b.signal) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| b.last_seen.cmp(&a.last_seen))
            .then_with(|| a.address.cmp(&b.address))
    });
    candidates
}

/// Arbitration with an explicit random source
pub fn decide_with<R: Rng + ?Sized>(
    weights: &HostWeights,
    forced: Option<ForcedRole>,
    peers: &[PeerRecord],
    known_hosts: &HashSet<(TransportKind, String)>,
    rng: &mut R,
) -> RoleDecision {
    let candidates = rank(peers, known_hosts);

    match forced {
        Some(ForcedRole::Host) => return RoleDecision::Host,
        Some(ForcedRole::Client) if candidates.is_empty() => return RoleDecision::Wait,
        Some(ForcedRole::Client) => return RoleDecision::Client { candidates },
        None => {}
    }

    if candidates.is_empty() {
        return RoleDecision::Host;
    }
    if candidates.iter().any(|p| is_known(p, known_hosts)) {
        tracing::debug!("Known host visible, rejoining");
        return RoleDecision::Client { candidates };
    }

    let p = weights.host_probability(candidates.len());
    if rng.random_bool(p) {
        RoleDecision::Host
    } else {
        RoleDecision::Client { candidates }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DiscoveredPeer;

    fn record(address: &str, is_host: bool, signal: Option<i32>) -> PeerRecord {
        let mut peer = DiscoveredPeer::new(address, address);
        peer.is_host = is_host;
        peer.signal = signal;
        PeerRecord::from_discovered(TransportKind::Memory, peer, 0)
    }

    fn arbitrator(seed: u64) -> RoleArbitrator {
        RoleArbitrator::new(&ArbitrationConfig {
            seed: Some(seed),
            ..Default::default()
        })
    }

    #[test]
    fn test_forced_role_wins() {
        let arb = arbitrator(1);
        let peers = vec![record("a", true, None)];
        let known = HashSet::new();
        assert_eq!(
            arb.decide(Some(ForcedRole::Host), &peers, &known),
            RoleDecision::Host
        );
        assert!(matches!(
            arb.decide(Some(ForcedRole::Client), &peers, &known),
            RoleDecision::Client { .. }
        ));
        assert_eq!(
            arb.decide(Some(ForcedRole::Client), &[], &known),
            RoleDecision::Wait
        );
    }

    #[test]
    fn test_no_peers_means_host() {
        let arb = arbitrator(7);
        assert_eq!(arb.decide(None, &[], &HashSet::new()), RoleDecision::Host);

        let mut busy = record("busy", true, None);
        busy.available = false;
        assert_eq!(arb.decide(None, &[busy], &HashSet::new()), RoleDecision::Host);
    }

    #[test]
    fn test_known_host_is_rejoined_first() {
        let arb = arbitrator(3);
        let peers = vec![record("stranger", true, Some(-20)), record("home", false, Some(-90))];
        let known = HashSet::from([(TransportKind::Memory, "home".to_string())]);
        for _ in 0..20 {
            match arb.decide(None, &peers, &known) {
                RoleDecision::Client { candidates } => assert_eq!(candidates[0].address, "home"),
                other => panic!("expected client, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_candidates_prefer_hosts_then_signal() {
        let peers = vec![
            record("weak-host", true, Some(-80)),
            record("strong", false, Some(-30)),
            record("strong-host", true, Some(-40)),
        ];
        let ranked = rank(&peers, &HashSet::new())
            .into_iter()
            .map(|p| p.address)
            .collect::<Vec<_>>();
        assert_eq!(ranked, vec!["strong-host", "weak-host", "strong"]);
    }

    #[test]
    fn test_host_probability_drives_split() {
        let weights = HostWeights::default();
        let peers = vec![record("a", true, None)];
        let known = HashSet::new();
        let mut rng = StdRng::seed_from_u64(42);
        let hosts = (0..4000)
            .filter(|_| {
                decide_with(&weights, None, &peers, &known, &mut rng) == RoleDecision::Host
            })
            .count();
        // single_peer weight is 0.25
        assert!((800..1200).contains(&hosts), "hosted {} of 4000", hosts);
    }

    #[test]
    fn test_same_seed_same_decisions() {
        let peers = vec![record("a", false, None), record("b", false, None)];
        let known = HashSet::new();
        let a = arbitrator(99);
        let b = arbitrator(99);
        for _ in 0..10 {
            assert_eq!(
                a.decide(None, &peers, &known),
                b.decide(None, &peers, &known)
            );
        }
    }
}
