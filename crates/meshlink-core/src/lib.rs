//! MeshLink Core Library
//!
//! Connection and mesh messaging engine for offline emergency networks.
//!
//! ## Overview
//!
//! Phones in a disaster zone lose their towers long before they lose their
//! batteries. MeshLink turns whatever short-range media a device has into a
//! self-organizing mesh: devices find each other, agree who hosts a group,
//! keep links alive, and relay each other's messages hop by hop until they
//! reach someone who needs them.
//!
//! ## Core Principles
//!
//! - **Offline-first**: nothing depends on infrastructure; cloud sync is opportunistic
//! - **Bounded flooding**: every envelope carries a hop budget and a route path
//! - **Never unreachable**: a lone device hosts so late joiners can find it
//!
//! ## Quick Start
//!
//! ```ignore
//! use meshlink_core::{MeshConfig, MeshNode, MemoryHub, OutboundMessage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = MemoryHub::new();
//!     let builder = MeshNode::builder(MeshConfig::default());
//!     let driver = hub.driver(builder.identity());
//!     let node = builder.driver(driver).build()?;
//!     node.start()?;
//!
//!     let mut events = node.subscribe();
//!     node.send(OutboundMessage::text("Water at the school gym")).await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod ack;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod events;
pub mod keepalive;
pub mod links;
pub mod logging;
pub mod messaging;
pub mod node;
pub mod peers;
pub mod queue;
pub mod role;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports
pub use config::{
    ArbitrationConfig, ConnectionConfig, DiscoveryConfig, HostWeights, MeshConfig,
    MessagingConfig, SyncConfig,
};
pub use connection::{ConnectionManager, ConnectionPhase, ConnectionState, RecoveryTier};
pub use discovery::{Discovery, DiscoveryOutcome};
pub use envelope::{Envelope, WireMessage};
pub use error::{MeshError, MeshResult};
pub use events::{MeshEvent, MeshStatus};
pub use links::{Link, LinkTable};
pub use messaging::{EngineStats, MessageEngine, OutboundMessage, ReceiveOutcome};
pub use node::{MeshNode, MeshNodeBuilder, EVENT_CHANNEL_CAPACITY};
pub use peers::{PeerRecord, PeerRegistry};
pub use queue::{PendingQueueEntry, QueueTarget, StoreForwardQueue};
pub use role::{RoleArbitrator, RoleDecision};
pub use storage::{
    EnvelopeOrigin, EnvelopeStore, KnownPeerCredentials, MemoryStore, RedbStore, StoredEnvelope,
};
pub use sync::{SyncBridge, SyncDriver, SyncReport};
pub use transport::{
    CapabilityDescriptor, DiscoveredPeer, DriverCapabilities, DriverEvent, DriverSet, MemoryDriver,
    MemoryHub, TransportDriver,
};
pub use types::*;
