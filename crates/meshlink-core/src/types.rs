//! Core types for MeshLink

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Stable identifier for a device participating in the mesh
///
/// Device ids travel inside every envelope's route path, so they are kept
/// as plain strings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a DeviceId from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random device id (used when no id is configured)
    pub fn generate() -> Self {
        Self(format!("dev-{}", Ulid::new().to_string().to_lowercase()))
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Globally unique envelope identifier
///
/// Built from the originating device id plus a ULID (millisecond timestamp
/// and 80 random bits), so two devices can never mint the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(pub String);

impl EnvelopeId {
    /// Mint a new id for an envelope originated by `device`
    pub fn generate(device: &DeviceId) -> Self {
        Self(format!("{}:{}", device, Ulid::new()))
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EnvelopeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Underlying medium a driver talks over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Direct device-to-device radio link (WiFi-Direct style groups)
    DirectRadio,
    /// Local access point / hotspot with a socket transport on top
    Hotspot,
    /// Service discovery on an existing local network
    LocalNetwork,
    /// In-process medium used by tests and simulations
    Memory,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::DirectRadio => write!(f, "direct-radio"),
            TransportKind::Hotspot => write!(f, "hotspot"),
            TransportKind::LocalNetwork => write!(f, "local-network"),
            TransportKind::Memory => write!(f, "memory"),
        }
    }
}

/// Kind of user-visible message carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Emergency,
    Sos,
    Location,
    System,
    File,
}

impl MessageKind {
    /// Whether this kind marks an emergency situation
    pub fn is_urgent(&self) -> bool {
        matches!(self, MessageKind::Emergency | MessageKind::Sos)
    }
}

/// Connection role of this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Role {
    /// Not connected and not attempting to connect
    #[default]
    None,
    /// Accepts inbound connections and relays
    Host,
    /// Connected outward to a host
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::None => write!(f, "none"),
            Role::Host => write!(f, "host"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Role pinned by an operator, bypassing arbitration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForcedRole {
    Host,
    Client,
}

/// Who this device is on the mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Device id stamped into route paths
    pub device_id: DeviceId,
    /// Human-readable name shown to peers
    pub display_name: String,
}

impl LocalIdentity {
    /// Create a new identity
    pub fn new(device_id: impl Into<DeviceId>, display_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            display_name: display_name.into(),
        }
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Current wall-clock time as Unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
