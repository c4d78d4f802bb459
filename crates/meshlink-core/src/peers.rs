//! Peer registry for devices seen during discovery
//!
//! Each driver reports a full snapshot of the peers it can see. The registry
//! merges those snapshots into one table keyed by (transport, address), so
//! the same physical device reachable over two media appears twice.
//!
//! ## Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  1. Discovery cycle starts, cycle_start recorded                │
//! │  2. PeersDiscovered(kind, snapshot) → replace that kind's rows  │
//! │  3. Rows seen again keep their first_seen                       │
//! │  4. Cycle completes → rows not reconfirmed since cycle_start    │
//! │     are purged                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::transport::DiscoveredPeer;
use crate::types::{now_millis, DeviceId, TransportKind};

/// A peer visible on some transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Transport-scoped address
    pub address: String,
    /// Medium the peer was seen on
    pub transport: TransportKind,
    /// Advertised name
    pub display_name: String,
    /// Mesh device id, when advertised
    pub device_id: Option<DeviceId>,
    /// Signal quality reported by the driver
    pub signal: Option<i32>,
    /// Whether the peer accepts connections right now
    pub available: bool,
    /// Whether the peer hosts a relay group
    pub is_host: bool,
    /// First time this row appeared (Unix millis)
    pub first_seen: i64,
    /// Last time a scan reconfirmed this row (Unix millis)
    pub last_seen: i64,
}

impl PeerRecord {
    /// Build a record from a driver report
    pub fn from_discovered(transport: TransportKind, peer: DiscoveredPeer, now: i64) -> Self {
        Self {
            address: peer.address,
            transport,
            display_name: peer.display_name,
            device_id: peer.device_id,
            signal: peer.signal,
            available: peer.available,
            is_host: peer.is_host,
            first_seen: now,
            last_seen: now,
        }
    }
}

type PeerKey = (TransportKind, String);

/// Merged view of every driver's discovery results
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerKey, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything known about one transport with a fresh snapshot
    pub fn apply_snapshot(&self, transport: TransportKind, snapshot: Vec<DiscoveredPeer>) {
        self.apply_snapshot_at(transport, snapshot, now_millis());
    }

    /// Same as [`PeerRegistry::apply_snapshot`] with an explicit clock
    pub fn apply_snapshot_at(
        &self,
        transport: TransportKind,
        snapshot: Vec<DiscoveredPeer>,
        now: i64,
    ) {
        let mut peers = self.peers.write();
        let mut previous = HashMap::new();
        peers.retain(|key, record| {
            if key.0 == transport {
                previous.insert(key.1.clone(), record.first_seen);
                false
            } else {
                true
            }
        });
        for peer in snapshot {
            let mut record = PeerRecord::from_discovered(transport, peer, now);
            if let Some(first_seen) = previous.get(&record.address) {
                record.first_seen = *first_seen;
            }
            peers.insert((transport, record.address.clone()), record);
        }
        tracing::debug!(%transport, total = peers.len(), "Applied discovery snapshot");
    }

    /// Drop one peer reported lost outside a scan
    pub fn mark_lost(&self, transport: TransportKind, address: &str) -> Option<PeerRecord> {
        self.peers.write().remove(&(transport, address.to_string()))
    }

    /// Purge rows not reconfirmed since `cycle_start`; returns how many went
    pub fn purge_unconfirmed(&self, cycle_start: i64) -> usize {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|_, record| record.last_seen >= cycle_start);
        before - peers.len()
    }

    /// Look up one row
    pub fn get(&self, transport: TransportKind, address: &str) -> Option<PeerRecord> {
        self.peers
            .read()
            .get(&(transport, address.to_string()))
            .cloned()
    }

    /// Every row, strongest signal first
    pub fn all(&self) -> Vec<PeerRecord> {
        let mut list = self.peers.read().values().cloned().collect::<Vec<_>>();
        list.sort_by(|a, b| {
            b.signal
                .cmp(&a.signal)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
                .then_with(|| a.address.cmp(&b.address))
        });
        list
    }

    /// Rows that currently accept connections
    pub fn available(&self) -> Vec<PeerRecord> {
        self.all().into_iter().filter(|p| p.available).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn clear(&self) {
        self.peers.write().clear();
    }
}
