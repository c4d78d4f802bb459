//! In-process transport
//!
//! A [`MemoryHub`] plays the role of the air between devices: every
//! [`MemoryDriver`] registered on the same hub can discover the others,
//! host groups, connect and exchange frames. The hub also lets a test or
//! simulation misbehave on purpose: severing a link so frames vanish
//! silently, refusing connects, hiding a device from scans.
//!
//! Addresses on this medium are the device ids themselves.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{DiscoveredPeer, DriverCapabilities, DriverEvent, TransportDriver};
use crate::error::{MeshError, MeshResult};
use crate::types::{DeviceId, LocalIdentity, TransportKind};

const EVENT_CAPACITY: usize = 256;

struct HubNode {
    display_name: String,
    events: broadcast::Sender<DriverEvent>,
    hosting: bool,
    discoverable: bool,
    frames_sent: u64,
    frames_dropped: u64,
    connect_attempts: u64,
    beacons_sent: u64,
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<String, HubNode>,
    links: HashSet<(String, String)>,
    severed: HashSet<(String, String)>,
    refused: HashSet<(String, String)>,
}

fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl HubState {
    fn notify(&self, address: &str, event: DriverEvent) {
        if let Some(node) = self.nodes.get(address) {
            // No receivers just means the node is not started yet
            let _ = node.events.send(event);
        }
    }

    fn linked_with(&self, address: &str) -> Vec<String> {
        self.links
            .iter()
            .filter_map(|(a, b)| {
                if a == address {
                    Some(b.clone())
                } else if b == address {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    fn drop_links_of(&mut self, address: &str) -> Vec<String> {
        let others = self.linked_with(address);
        for other in &others {
            self.links.remove(&pair(address, other));
        }
        others
    }
}

/// Shared medium connecting in-process drivers
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device on the hub and return its driver
    ///
    /// Registering the same device twice replaces its event channel.
    pub fn driver(&self, identity: &LocalIdentity) -> Arc<MemoryDriver> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let address = identity.device_id.as_str().to_string();
        self.state.lock().nodes.insert(
            address.clone(),
            HubNode {
                display_name: identity.display_name.clone(),
                events: events.clone(),
                hosting: false,
                discoverable: true,
                frames_sent: 0,
                frames_dropped: 0,
                connect_attempts: 0,
                beacons_sent: 0,
            },
        );
        Arc::new(MemoryDriver {
            hub: self.clone(),
            address,
            events,
        })
    }

    /// Bring up a link between two devices regardless of roles
    pub fn link(&self, a: &str, b: &str) {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(a) || !state.nodes.contains_key(b) {
            return;
        }
        if state.links.insert(pair(a, b)) {
            state.notify(
                a,
                DriverEvent::ConnectionStateChanged {
                    address: Some(b.to_string()),
                    connected: true,
                },
            );
            state.notify(
                b,
                DriverEvent::ConnectionStateChanged {
                    address: Some(a.to_string()),
                    connected: true,
                },
            );
        }
    }

    /// Take a link down and tell both ends
    pub fn unlink(&self, a: &str, b: &str) {
        let mut state = self.state.lock();
        if state.links.remove(&pair(a, b)) {
            state.notify(
                a,
                DriverEvent::ConnectionStateChanged {
                    address: Some(b.to_string()),
                    connected: false,
                },
            );
            state.notify(
                b,
                DriverEvent::ConnectionStateChanged {
                    address: Some(a.to_string()),
                    connected: false,
                },
            );
        }
    }

    /// Silently drop every frame between two devices while the link stays up
    pub fn sever(&self, a: &str, b: &str) {
        self.state.lock().severed.insert(pair(a, b));
    }

    /// Undo [`MemoryHub::sever`]
    pub fn heal(&self, a: &str, b: &str) {
        self.state.lock().severed.remove(&pair(a, b));
    }

    /// Make `to` refuse connects coming from `from`
    pub fn refuse(&self, from: &str, to: &str) {
        self.state
            .lock()
            .refused
            .insert((from.to_string(), to.to_string()));
    }

    /// Hide or show a device in scans
    pub fn set_discoverable(&self, address: &str, discoverable: bool) {
        if let Some(node) = self.state.lock().nodes.get_mut(address) {
            node.discoverable = discoverable;
        }
    }

    /// Whether two devices are linked
    pub fn is_linked(&self, a: &str, b: &str) -> bool {
        self.state.lock().links.contains(&pair(a, b))
    }

    /// Whether a device is hosting a group
    pub fn is_hosting(&self, address: &str) -> bool {
        self.state
            .lock()
            .nodes
            .get(address)
            .is_some_and(|n| n.hosting)
    }

    /// Frames delivered by a device so far
    pub fn frames_sent(&self, address: &str) -> u64 {
        self.state
            .lock()
            .nodes
            .get(address)
            .map_or(0, |n| n.frames_sent)
    }

    /// Frames a device sent into a severed link
    pub fn frames_dropped(&self, address: &str) -> u64 {
        self.state
            .lock()
            .nodes
            .get(address)
            .map_or(0, |n| n.frames_dropped)
    }

    /// Outbound connect attempts made by a device
    pub fn connect_attempts(&self, address: &str) -> u64 {
        self.state
            .lock()
            .nodes
            .get(address)
            .map_or(0, |n| n.connect_attempts)
    }

    /// Beacons emitted by a device
    pub fn beacons_sent(&self, address: &str) -> u64 {
        self.state
            .lock()
            .nodes
            .get(address)
            .map_or(0, |n| n.beacons_sent)
    }

    /// Remove a device as if it powered off
    pub fn remove(&self, address: &str) {
        let mut state = self.state.lock();
        for other in state.drop_links_of(address) {
            state.notify(
                &other,
                DriverEvent::ConnectionStateChanged {
                    address: Some(address.to_string()),
                    connected: false,
                },
            );
        }
        state.nodes.remove(address);
    }
}

/// Driver for one device on a [`MemoryHub`]
pub struct MemoryDriver {
    hub: MemoryHub,
    address: String,
    events: broadcast::Sender<DriverEvent>,
}

impl MemoryDriver {
    /// This device's address on the hub
    pub fn address(&self) -> &str {
        &self.address
    }

    fn snapshot(&self) -> Vec<DiscoveredPeer> {
        let state = self.hub.state.lock();
        let mut peers = state
            .nodes
            .iter()
            .filter(|(addr, node)| *addr != &self.address && node.discoverable)
            .map(|(addr, node)| DiscoveredPeer {
                address: addr.clone(),
                display_name: node.display_name.clone(),
                device_id: Some(DeviceId::new(addr.clone())),
                signal: None,
                available: true,
                is_host: node.hosting,
            })
            .collect::<Vec<_>>();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }
}

#[async_trait]
impl TransportDriver for MemoryDriver {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            can_host: true,
            can_discover: true,
            supports_beacon: true,
            max_clients: None,
        }
    }

    async fn start_discovery(&self) -> MeshResult<()> {
        let peers = self.snapshot();
        let _ = self.events.send(DriverEvent::PeersDiscovered { peers });
        let _ = self.events.send(DriverEvent::DiscoveryFinished);
        Ok(())
    }

    async fn stop_discovery(&self) -> MeshResult<()> {
        Ok(())
    }

    async fn create_group(&self) -> MeshResult<()> {
        let mut state = self.hub.state.lock();
        let node = state
            .nodes
            .get_mut(&self.address)
            .ok_or_else(|| MeshError::Transport(format!("{} left the hub", self.address)))?;
        node.hosting = true;
        Ok(())
    }

    async fn connect(&self, address: &str) -> MeshResult<bool> {
        let mut state = self.hub.state.lock();
        if let Some(node) = state.nodes.get_mut(&self.address) {
            node.connect_attempts += 1;
        }
        let accepts = state.nodes.get(address).is_some_and(|n| n.hosting)
            && !state
                .refused
                .contains(&(self.address.clone(), address.to_string()));
        if !accepts {
            return Ok(false);
        }
        if state.links.insert(pair(&self.address, address)) {
            state.notify(
                &self.address,
                DriverEvent::ConnectionStateChanged {
                    address: Some(address.to_string()),
                    connected: true,
                },
            );
            state.notify(
                address,
                DriverEvent::ConnectionStateChanged {
                    address: Some(self.address.clone()),
                    connected: true,
                },
            );
        }
        Ok(true)
    }

    async fn disconnect(&self) -> MeshResult<()> {
        let mut state = self.hub.state.lock();
        if let Some(node) = state.nodes.get_mut(&self.address) {
            node.hosting = false;
        }
        for other in state.drop_links_of(&self.address) {
            state.notify(
                &other,
                DriverEvent::ConnectionStateChanged {
                    address: Some(self.address.clone()),
                    connected: false,
                },
            );
        }
        Ok(())
    }

    async fn send_bytes(&self, address: &str, payload: Bytes) -> MeshResult<()> {
        let mut state = self.hub.state.lock();
        let key = pair(&self.address, address);
        if !state.links.contains(&key) {
            return Err(MeshError::Transport(format!(
                "{} is not linked to {}",
                self.address, address
            )));
        }
        let severed = state.severed.contains(&key);
        if let Some(node) = state.nodes.get_mut(&self.address) {
            if severed {
                node.frames_dropped += 1;
            } else {
                node.frames_sent += 1;
            }
        }
        if !severed {
            state.notify(
                address,
                DriverEvent::BytesReceived {
                    from: self.address.clone(),
                    payload,
                },
            );
        }
        Ok(())
    }

    async fn send_beacon(&self, payload: Bytes) -> MeshResult<()> {
        let mut state = self.hub.state.lock();
        if let Some(node) = state.nodes.get_mut(&self.address) {
            node.beacons_sent += 1;
        }
        let targets = state
            .nodes
            .keys()
            .filter(|addr| *addr != &self.address)
            .filter(|addr| !state.severed.contains(&pair(&self.address, addr)))
            .cloned()
            .collect::<Vec<_>>();
        for target in targets {
            state.notify(
                &target,
                DriverEvent::BytesReceived {
                    from: self.address.clone(),
                    payload: payload.clone(),
                },
            );
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (MemoryHub, Arc<MemoryDriver>, Arc<MemoryDriver>) {
        let hub = MemoryHub::new();
        let a = hub.driver(&LocalIdentity::new("a", "Alpha"));
        let b = hub.driver(&LocalIdentity::new("b", "Bravo"));
        (hub, a, b)
    }

    #[tokio::test]
    async fn test_discovery_reports_snapshot_then_finish() {
        let (_hub, a, b) = setup();
        b.create_group().await.unwrap();
        let mut rx = a.subscribe();
        a.start_discovery().await.unwrap();

        match rx.recv().await.unwrap() {
            DriverEvent::PeersDiscovered { peers } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].address, "b");
                assert_eq!(peers[0].display_name, "Bravo");
                assert!(peers[0].is_host);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            DriverEvent::DiscoveryFinished
        ));
    }

    #[tokio::test]
    async fn test_connect_requires_hosting_peer() {
        let (hub, a, b) = setup();
        assert!(!a.connect("b").await.unwrap());
        b.create_group().await.unwrap();
        assert!(a.connect("b").await.unwrap());
        assert!(hub.is_linked("a", "b"));
        assert_eq!(hub.connect_attempts("a"), 2);
    }

    #[tokio::test]
    async fn test_refused_connect() {
        let (hub, a, b) = setup();
        b.create_group().await.unwrap();
        hub.refuse("a", "b");
        assert!(!a.connect("b").await.unwrap());
        assert!(!hub.is_linked("a", "b"));
    }

    #[tokio::test]
    async fn test_send_delivers_to_linked_peer_only() {
        let (hub, a, b) = setup();
        let mut rx = b.subscribe();
        assert!(a.send_bytes("b", Bytes::from_static(b"x")).await.is_err());

        hub.link("a", "b");
        // Link-up notification first
        assert!(matches!(
            rx.recv().await.unwrap(),
            DriverEvent::ConnectionStateChanged { connected: true, .. }
        ));
        a.send_bytes("b", Bytes::from_static(b"hello")).await.unwrap();
        match rx.recv().await.unwrap() {
            DriverEvent::BytesReceived { from, payload } => {
                assert_eq!(from, "a");
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(hub.frames_sent("a"), 1);
    }

    #[tokio::test]
    async fn test_severed_link_drops_silently() {
        let (hub, a, b) = setup();
        hub.link("a", "b");
        let mut rx = b.subscribe();
        hub.sever("a", "b");
        a.send_bytes("b", Bytes::from_static(b"lost")).await.unwrap();
        assert_eq!(hub.frames_dropped("a"), 1);
        assert!(rx.try_recv().is_err());

        hub.heal("a", "b");
        a.send_bytes("b", Bytes::from_static(b"found")).await.unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            DriverEvent::BytesReceived { .. }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remote_side() {
        let (hub, a, b) = setup();
        b.create_group().await.unwrap();
        assert!(a.connect("b").await.unwrap());
        let mut rx = b.subscribe();
        a.disconnect().await.unwrap();
        assert!(!hub.is_linked("a", "b"));
        match rx.recv().await.unwrap() {
            DriverEvent::ConnectionStateChanged { address, connected } => {
                assert_eq!(address.as_deref(), Some("a"));
                assert!(!connected);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_beacon_reaches_unlinked_devices() {
        let (hub, a, b) = setup();
        let mut rx = b.subscribe();
        a.send_beacon(Bytes::from_static(b"sos")).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            DriverEvent::BytesReceived { .. }
        ));
        assert_eq!(hub.beacons_sent("a"), 1);
    }
}
