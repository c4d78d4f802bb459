//! Transport driver abstraction
//!
//! The engine never talks to radios or sockets directly. Each medium
//! (direct radio groups, a local hotspot, local-network service discovery)
//! is wrapped in a [`TransportDriver`], and the engine treats all of them
//! uniformly.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  DriverSet (registration order = preference order)              │
//! │  ├── TransportDriver: DirectRadio                               │
//! │  ├── TransportDriver: Hotspot                                   │
//! │  └── TransportDriver: LocalNetwork                              │
//! │                                                                 │
//! │  Each driver publishes DriverEvents on a broadcast channel:     │
//! │  ├── PeersDiscovered (full snapshot per scan)                   │
//! │  ├── DiscoveryFinished                                          │
//! │  ├── ConnectionStateChanged                                     │
//! │  └── BytesReceived                                              │
//! │                                                                 │
//! │  CapabilityDescriptor: negotiated once at startup               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::{MeshError, MeshResult};
use crate::types::{DeviceId, TransportKind};

pub use memory::{MemoryDriver, MemoryHub};

/// A peer as reported by one driver's discovery scan
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeer {
    /// Transport-scoped address (MAC, IP:port, service name)
    pub address: String,
    /// Name advertised by the peer
    pub display_name: String,
    /// Mesh device id, when the medium advertises it
    pub device_id: Option<DeviceId>,
    /// Signal quality in dBm or a driver-defined score
    pub signal: Option<i32>,
    /// Whether the peer currently accepts connections
    pub available: bool,
    /// Whether the peer is hosting a relay group
    pub is_host: bool,
}

impl DiscoveredPeer {
    /// Create an available, non-hosting peer
    pub fn new(address: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: display_name.into(),
            device_id: None,
            signal: None,
            available: true,
            is_host: false,
        }
    }
}

/// Events emitted by a transport driver
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Snapshot of every peer currently visible to this driver
    PeersDiscovered { peers: Vec<DiscoveredPeer> },
    /// The driver finished the scan started by `start_discovery`
    DiscoveryFinished,
    /// A single peer disappeared outside a scan
    PeerLost { address: String },
    /// A link (`address: Some`) or the whole session (`None`) changed state
    ConnectionStateChanged {
        address: Option<String>,
        connected: bool,
    },
    /// Raw frame received from `from`
    BytesReceived { from: String, payload: Bytes },
    /// Driver-level failure on the active session
    Error { message: String },
}

/// What a driver can do, reported once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Can create a group / access point and accept clients
    pub can_host: bool,
    /// Can scan for peers
    pub can_discover: bool,
    /// Can emit connectionless beacons
    pub supports_beacon: bool,
    /// Maximum clients a hosted group accepts
    pub max_clients: Option<usize>,
}

impl Default for DriverCapabilities {
    fn default() -> Self {
        Self {
            can_host: true,
            can_discover: true,
            supports_beacon: false,
            max_clients: None,
        }
    }
}

/// A single underlying medium
#[async_trait]
pub trait TransportDriver: Send + Sync + 'static {
    /// Which medium this driver wraps
    fn kind(&self) -> TransportKind;

    /// Static capabilities of this driver
    fn capabilities(&self) -> DriverCapabilities;

    /// Begin a scan; results arrive as `PeersDiscovered` then `DiscoveryFinished`
    async fn start_discovery(&self) -> MeshResult<()>;

    /// Stop an in-progress scan
    async fn stop_discovery(&self) -> MeshResult<()>;

    /// Become a host: create a group / access point and accept clients
    async fn create_group(&self) -> MeshResult<()>;

    /// Connect outward to a hosting peer; `Ok(false)` when refused
    async fn connect(&self, address: &str) -> MeshResult<bool>;

    /// Tear down the active session and every link on it
    async fn disconnect(&self) -> MeshResult<()>;

    /// Send one frame to a linked peer
    async fn send_bytes(&self, address: &str, payload: Bytes) -> MeshResult<()>;

    /// Emit a connectionless beacon to anything in range
    async fn send_beacon(&self, _payload: Bytes) -> MeshResult<()> {
        Ok(())
    }

    /// Subscribe to this driver's events
    fn subscribe(&self) -> broadcast::Receiver<DriverEvent>;
}

/// All registered drivers, in preference order
#[derive(Clone, Default)]
pub struct DriverSet {
    drivers: Vec<Arc<dyn TransportDriver>>,
}

impl DriverSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver; a second driver for the same medium is rejected
    pub fn register(&mut self, driver: Arc<dyn TransportDriver>) -> MeshResult<()> {
        let kind = driver.kind();
        if self.get(kind).is_some() {
            return Err(MeshError::InvalidOperation(format!(
                "driver for {} already registered",
                kind
            )));
        }
        self.drivers.push(driver);
        Ok(())
    }

    /// Look up the driver for a medium
    pub fn get(&self, kind: TransportKind) -> Option<&Arc<dyn TransportDriver>> {
        self.drivers.iter().find(|d| d.kind() == kind)
    }

    /// Look up the driver for a medium or fail
    pub fn require(&self, kind: TransportKind) -> MeshResult<&Arc<dyn TransportDriver>> {
        self.get(kind)
            .ok_or_else(|| MeshError::NoDriver(kind.to_string()))
    }

    /// Iterate drivers in preference order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TransportDriver>> {
        self.drivers.iter()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

/// Capabilities of every driver, frozen at startup
///
/// The connection state machine consults only this descriptor, so no
/// platform checks leak into connection logic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityDescriptor {
    entries: Vec<(TransportKind, DriverCapabilities)>,
}

impl CapabilityDescriptor {
    /// Query every driver once
    pub fn negotiate(drivers: &DriverSet) -> Self {
        let entries = drivers
            .iter()
            .map(|d| (d.kind(), d.capabilities()))
            .collect::<Vec<_>>();
        tracing::debug!(drivers = entries.len(), "Negotiated transport capabilities");
        Self { entries }
    }

    /// Capabilities of one medium
    pub fn get(&self, kind: TransportKind) -> Option<DriverCapabilities> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, caps)| *caps)
    }

    /// Media able to host, in preference order
    pub fn host_transports(&self) -> Vec<TransportKind> {
        self.filter(|c| c.can_host)
    }

    /// Media able to scan, in preference order
    pub fn discovery_transports(&self) -> Vec<TransportKind> {
        self.filter(|c| c.can_discover)
    }

    /// Media able to emit beacons
    pub fn beacon_transports(&self) -> Vec<TransportKind> {
        self.filter(|c| c.supports_beacon)
    }

    /// First medium able to host
    pub fn preferred_host(&self) -> Option<TransportKind> {
        self.host_transports().into_iter().next()
    }

    fn filter(&self, pred: impl Fn(&DriverCapabilities) -> bool) -> Vec<TransportKind> {
        self.entries
            .iter()
            .filter(|(_, caps)| pred(caps))
            .map(|(kind, _)| *kind)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LocalIdentity;

    #[test]
    fn test_driver_set_rejects_duplicate_medium() {
        let hub = MemoryHub::new();
        let mut set = DriverSet::new();
        set.register(hub.driver(&LocalIdentity::new("a", "A"))).unwrap();
        let err = set
            .register(hub.driver(&LocalIdentity::new("b", "B")))
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidOperation(_)));
        assert_eq!(set.len(), 1);
        assert!(set.require(TransportKind::Hotspot).is_err());
    }

    #[test]
    fn test_capability_negotiation() {
        let hub = MemoryHub::new();
        let mut set = DriverSet::new();
        set.register(hub.driver(&LocalIdentity::new("a", "A"))).unwrap();
        let caps = CapabilityDescriptor::negotiate(&set);
        assert_eq!(caps.preferred_host(), Some(TransportKind::Memory));
        assert_eq!(caps.discovery_transports(), vec![TransportKind::Memory]);
        assert_eq!(caps.beacon_transports(), vec![TransportKind::Memory]);
        assert!(caps.get(TransportKind::DirectRadio).is_none());
    }
}
