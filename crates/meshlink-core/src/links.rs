//! Active links to identified peers
//!
//! A link exists once a transport connection is up *and* the remote side has
//! sent its handshake, so the device id behind an address is known. The
//! message engine reads this table to decide where frames go.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::types::{now_millis, DeviceId, TransportKind};

/// One identified peer reachable over a transport
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub device_id: DeviceId,
    pub display_name: String,
    pub transport: TransportKind,
    /// Transport-scoped address used with the driver
    pub address: String,
    /// When the handshake completed (Unix millis)
    pub linked_at: i64,
    /// Last frame received on this link (Unix millis)
    pub last_seen: i64,
}

impl Link {
    pub fn new(
        device_id: DeviceId,
        display_name: impl Into<String>,
        transport: TransportKind,
        address: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            device_id,
            display_name: display_name.into(),
            transport,
            address: address.into(),
            linked_at: now,
            last_seen: now,
        }
    }

    /// Whether this link runs over `transport` to `address`
    pub fn is_at(&self, transport: TransportKind, address: &str) -> bool {
        self.transport == transport && self.address == address
    }
}

/// Table of active links plus every device ever linked
#[derive(Default)]
pub struct LinkTable {
    links: RwLock<HashMap<DeviceId, Link>>,
    known: RwLock<HashSet<DeviceId>>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a link; returns true when the device was not linked
    pub fn insert(&self, link: Link) -> bool {
        self.known.write().insert(link.device_id.clone());
        let mut links = self.links.write();
        // A device re-handshaking over another address replaces the old link
        links.insert(link.device_id.clone(), link).is_none()
    }

    /// Remove whatever link runs over `transport` to `address`
    pub fn remove_by_address(&self, transport: TransportKind, address: &str) -> Option<Link> {
        let mut links = self.links.write();
        let device = links
            .values()
            .find(|l| l.is_at(transport, address))
            .map(|l| l.device_id.clone())?;
        links.remove(&device)
    }

    /// Remove every link on a transport
    pub fn remove_transport(&self, transport: TransportKind) -> Vec<Link> {
        let mut links = self.links.write();
        let doomed = links
            .values()
            .filter(|l| l.transport == transport)
            .map(|l| l.device_id.clone())
            .collect::<Vec<_>>();
        doomed
            .iter()
            .filter_map(|device| links.remove(device))
            .collect()
    }

    /// Remove every link
    pub fn clear(&self) -> Vec<Link> {
        self.links.write().drain().map(|(_, link)| link).collect()
    }

    pub fn get(&self, device: &DeviceId) -> Option<Link> {
        self.links.read().get(device).cloned()
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        self.links.read().contains_key(device)
    }

    /// Device behind an address, once identified
    pub fn device_at(&self, transport: TransportKind, address: &str) -> Option<DeviceId> {
        self.links
            .read()
            .values()
            .find(|l| l.is_at(transport, address))
            .map(|l| l.device_id.clone())
    }

    /// Refresh `last_seen` for the link at an address
    pub fn touch(&self, transport: TransportKind, address: &str) {
        let now = now_millis();
        if let Some(link) = self
            .links
            .write()
            .values_mut()
            .find(|l| l.is_at(transport, address))
        {
            link.last_seen = now;
        }
    }

    /// Every active link, ordered by device id
    pub fn all(&self) -> Vec<Link> {
        let mut list = self.links.read().values().cloned().collect::<Vec<_>>();
        list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        list
    }

    /// Linked device ids, ordered
    pub fn devices(&self) -> Vec<DeviceId> {
        self.all().into_iter().map(|l| l.device_id).collect()
    }

    /// Every device that has ever completed a handshake with us
    pub fn known_devices(&self) -> Vec<DeviceId> {
        let mut list = self.known.read().iter().cloned().collect::<Vec<_>>();
        list.sort();
        list
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }
}
