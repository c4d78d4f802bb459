//! Mesh event types and the status snapshot
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  MeshEvent: notifications for the embedding application         │
//! │  ├── EnvelopeDelivered: an envelope addressed to us arrived     │
//! │  ├── PeerConnected / PeerDisconnected: link table changes       │
//! │  ├── PeersDiscovered: a discovery cycle settled                 │
//! │  ├── StatusChanged: connection phase or role moved              │
//! │  ├── DeliveryConfirmed / DeliveryFailed: ack outcome            │
//! │  ├── EmergencyBeacon: a nearby device is in distress            │
//! │  └── SyncCompleted: cloud sync round finished                   │
//! │                                                                 │
//! │  MeshStatus: point-in-time snapshot for status screens          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::Serialize;

use crate::connection::{ConnectionPhase, RecoveryTier};
use crate::envelope::Envelope;
use crate::messaging::EngineStats;
use crate::peers::PeerRecord;
use crate::types::{DeviceId, EnvelopeId, ForcedRole, Role, TransportKind};

/// Events emitted by a mesh node
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// An envelope addressed to this device (or broadcast) was accepted
    EnvelopeDelivered(Envelope),
    /// A peer completed its handshake on a link
    PeerConnected {
        device_id: DeviceId,
        display_name: String,
        transport: TransportKind,
    },
    /// A link to a peer went away
    PeerDisconnected { device_id: DeviceId },
    /// A discovery cycle settled with these peers
    PeersDiscovered(Vec<PeerRecord>),
    /// Connection phase or role changed
    StatusChanged { phase: ConnectionPhase, role: Role },
    /// The target confirmed an envelope we originated
    DeliveryConfirmed {
        envelope_id: EnvelopeId,
        by: DeviceId,
    },
    /// An acknowledged envelope ran out of retries
    DeliveryFailed { envelope_id: EnvelopeId },
    /// A nearby device broadcast an emergency beacon
    EmergencyBeacon {
        device_id: DeviceId,
        display_name: String,
    },
    /// Cloud sync pushed and pulled this many envelopes
    SyncCompleted { pushed: usize, pulled: usize },
}

impl fmt::Display for MeshEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshEvent::EnvelopeDelivered(env) => {
                write!(f, "delivered {} from {}", env.id, env.sender_id)
            }
            MeshEvent::PeerConnected {
                device_id,
                transport,
                ..
            } => write!(f, "peer {} connected over {}", device_id, transport),
            MeshEvent::PeerDisconnected { device_id } => {
                write!(f, "peer {} disconnected", device_id)
            }
            MeshEvent::PeersDiscovered(peers) => write!(f, "discovered {} peers", peers.len()),
            MeshEvent::StatusChanged { phase, role } => {
                write!(f, "status {} as {}", phase, role)
            }
            MeshEvent::DeliveryConfirmed { envelope_id, by } => {
                write!(f, "{} confirmed by {}", envelope_id, by)
            }
            MeshEvent::DeliveryFailed { envelope_id } => {
                write!(f, "{} was never confirmed", envelope_id)
            }
            MeshEvent::EmergencyBeacon { device_id, .. } => {
                write!(f, "emergency beacon from {}", device_id)
            }
            MeshEvent::SyncCompleted { pushed, pulled } => {
                write!(f, "sync pushed {} pulled {}", pushed, pulled)
            }
        }
    }
}

/// Snapshot of a node's connection and messaging state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeshStatus {
    pub device_id: DeviceId,
    pub display_name: String,
    pub role: Role,
    pub phase: ConnectionPhase,
    pub connected: bool,
    /// Medium of the active session
    pub transport: Option<TransportKind>,
    /// Host we joined, when acting as client
    pub host_address: Option<String>,
    pub consecutive_failures: u32,
    pub tier: RecoveryTier,
    pub emergency: bool,
    pub forced_role: Option<ForcedRole>,
    /// Devices with a completed handshake
    pub linked_peers: Vec<DeviceId>,
    /// Peers visible from the last discovery
    pub discovered_peers: usize,
    /// Envelopes waiting in the store-and-forward queue
    pub queued_messages: usize,
    /// Envelopes waiting for an ack
    pub pending_acks: usize,
    /// Last successful keep-alive round trip (Unix millis)
    pub last_keepalive_ok: Option<i64>,
    pub stats: EngineStats,
}

impl fmt::Display for MeshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {} as {}, {} linked, {} queued, tier {}",
            self.display_name,
            self.device_id,
            self.phase,
            self.role,
            self.linked_peers.len(),
            self.queued_messages,
            self.tier
        )
    }
}
