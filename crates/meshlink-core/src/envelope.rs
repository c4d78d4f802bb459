//! Mesh envelopes and the wire protocol
//!
//! Every frame exchanged between devices is a [`WireMessage`]: a JSON object
//! whose `type` key discriminates user envelopes from control traffic.
//!
//! ## Message Flow
//!
//! ```text
//! Device B (client)                 Device A (host)
//!   |--- handshake {deviceId} ------->|
//!   |<-- handshake {deviceId} --------|
//!   |                                 |
//!   |--- ping {seq: 7} -------------->|
//!   |<-- pong {seq: 7} ---------------|
//!   |                                 |
//!   |--- message {ttl: 5, [B]} ------>|  deliver, relay with ttl 4, [B, A]
//!   |<-- ack {returnPath: [B]} -------|  (only when requiresAck)
//! ```
//!
//! ## Envelope invariants
//!
//! - The route path lists every device that has handled the envelope, the
//!   originator first. Each relay appends itself exactly once and decrements
//!   the TTL by one.
//! - A device never relays an envelope whose route path already names it.
//! - An envelope whose decremented TTL would reach zero is not relayed.
//! - Ack retries keep the id and bump `attempt`; relays forward each attempt
//!   once, the target delivers the id once.

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};
use crate::types::{now_millis, DeviceId, EnvelopeId, LocalIdentity, MessageKind};

/// The unit of mesh messaging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Globally unique id, minted by the originator
    pub id: EnvelopeId,
    /// Originating device
    pub sender_id: DeviceId,
    /// Originator's display name
    pub sender_name: String,
    /// Message body
    pub body: String,
    /// Message kind
    pub kind: MessageKind,
    /// Creation time (Unix milliseconds)
    pub timestamp_millis: i64,
    /// Remaining hop budget
    pub ttl: u8,
    /// Devices already traversed, originator first
    pub route_path: Vec<DeviceId>,
    /// Addressed device; `None` means broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device_id: Option<DeviceId>,
    /// Latitude of the sender, when shared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    /// Longitude of the sender, when shared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    /// Whether the target should confirm receipt
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_ack: bool,
    /// Retry number; 0 for the first transmission
    #[serde(default, skip_serializing_if = "is_first_attempt")]
    pub attempt: u32,
}

fn is_first_attempt(attempt: &u32) -> bool {
    *attempt == 0
}

impl Envelope {
    /// Build a fresh outbound envelope originated by `origin`
    pub fn new(
        origin: &LocalIdentity,
        body: impl Into<String>,
        kind: MessageKind,
        target: Option<DeviceId>,
        ttl: u8,
    ) -> Self {
        Self {
            id: EnvelopeId::generate(&origin.device_id),
            sender_id: origin.device_id.clone(),
            sender_name: origin.display_name.clone(),
            body: body.into(),
            kind,
            timestamp_millis: now_millis(),
            ttl,
            route_path: vec![origin.device_id.clone()],
            target_device_id: target,
            lat: None,
            lon: None,
            requires_ack: false,
            attempt: 0,
        }
    }

    /// Attach a geolocation
    pub fn with_location(mut self, lat: f64, lon: f64) -> Self {
        self.lat = Some(lat);
        self.lon = Some(lon);
        self
    }

    /// Override the generated id
    pub fn with_id(mut self, id: EnvelopeId) -> Self {
        self.id = id;
        self
    }

    /// Request delivery confirmation from the target
    pub fn with_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    /// Key relays dedup on
    ///
    /// Each retry of an acked envelope gets its own key so relays that
    /// already forwarded an earlier attempt pass the retry along. Delivery
    /// still dedups on the bare id.
    pub fn relay_key(&self) -> EnvelopeId {
        if self.attempt == 0 {
            self.id.clone()
        } else {
            EnvelopeId(format!("{}#{}", self.id, self.attempt))
        }
    }

    /// Whether the envelope is addressed to every device
    pub fn is_broadcast(&self) -> bool {
        self.target_device_id.is_none()
    }

    /// Whether `device` should deliver this envelope to its application
    pub fn is_addressed_to(&self, device: &DeviceId) -> bool {
        match &self.target_device_id {
            None => true,
            Some(target) => target == device,
        }
    }

    /// Whether `device` already appears in the route path
    pub fn has_traversed(&self, device: &DeviceId) -> bool {
        self.route_path.iter().any(|d| d == device)
    }

    /// The device that handed this envelope to us
    pub fn previous_hop(&self) -> Option<&DeviceId> {
        self.route_path.last()
    }

    /// Copy of this envelope as relayed by `via`
    ///
    /// Returns `None` when the hop budget is spent or `via` has already
    /// handled the envelope.
    pub fn relay_copy(&self, via: &DeviceId) -> Option<Envelope> {
        if self.ttl <= 1 || self.has_traversed(via) {
            return None;
        }
        let mut next = self.clone();
        next.ttl -= 1;
        next.route_path.push(via.clone());
        Some(next)
    }

    /// Encode as a wire frame
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        WireMessage::Message(self.clone()).encode()
    }
}

/// Every frame that travels between devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WireMessage {
    /// User-visible envelope
    Message(Envelope),
    /// Identity exchange sent on every link-up
    Handshake {
        device_id: DeviceId,
        device_name: String,
    },
    /// Link liveness refresh
    Heartbeat { device_id: DeviceId },
    /// Keep-alive probe
    Ping {
        seq: u64,
        sent_at_millis: i64,
        device_id: DeviceId,
    },
    /// Keep-alive reply echoing the probe's sequence
    Pong {
        seq: u64,
        sent_at_millis: i64,
        device_id: DeviceId,
    },
    /// Delivery confirmation, source-routed back along `return_path`
    Ack {
        envelope_id: EnvelopeId,
        device_id: DeviceId,
        return_path: Vec<DeviceId>,
    },
    /// Fire-and-forget presence beacon
    Beacon {
        device_id: DeviceId,
        device_name: String,
        emergency: bool,
    },
}

impl WireMessage {
    /// Encode to JSON bytes
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON bytes
    ///
    /// Malformed frames and unknown `type` discriminators are protocol
    /// violations.
    pub fn decode(data: &[u8]) -> MeshResult<Self> {
        serde_json::from_slice(data).map_err(|e| MeshError::Protocol(e.to_string()))
    }

    /// Short name of the frame type, for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::Message(_) => "message",
            WireMessage::Handshake { .. } => "handshake",
            WireMessage::Heartbeat { .. } => "heartbeat",
            WireMessage::Ping { .. } => "ping",
            WireMessage::Pong { .. } => "pong",
            WireMessage::Ack { .. } => "ack",
            WireMessage::Beacon { .. } => "beacon",
        }
    }

    /// Check if this frame carries a user-visible envelope
    pub fn is_envelope(&self) -> bool {
        matches!(self, WireMessage::Message(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> LocalIdentity {
        LocalIdentity::new(id, format!("{} name", id))
    }

    #[test]
    fn test_new_envelope_starts_route_with_origin() {
        let env = Envelope::new(&identity("b"), "hello", MessageKind::Text, None, 5);
        assert_eq!(env.route_path, vec![DeviceId::new("b")]);
        assert_eq!(env.sender_id, DeviceId::new("b"));
        assert!(env.is_broadcast());
        assert!(env.is_addressed_to(&DeviceId::new("anyone")));
    }

    #[test]
    fn test_relay_copy_decrements_and_appends_once() {
        let env = Envelope::new(&identity("b"), "hello", MessageKind::Text, None, 3);
        let hop = env.relay_copy(&DeviceId::new("a")).unwrap();
        assert_eq!(hop.ttl, 2);
        assert_eq!(hop.route_path, vec![DeviceId::new("b"), DeviceId::new("a")]);
        assert_eq!(hop.previous_hop(), Some(&DeviceId::new("a")));

        // A device already on the path never relays again
        assert!(hop.relay_copy(&DeviceId::new("a")).is_none());
        assert!(hop.relay_copy(&DeviceId::new("b")).is_none());
    }

    #[test]
    fn test_relay_copy_stops_at_ttl_exhaustion() {
        let env = Envelope::new(&identity("b"), "x", MessageKind::Text, None, 1);
        assert!(env.relay_copy(&DeviceId::new("a")).is_none());

        let mut spent = env.clone();
        spent.ttl = 0;
        assert!(spent.relay_copy(&DeviceId::new("a")).is_none());
    }

    #[test]
    fn test_retry_attempts_get_distinct_relay_keys() {
        let env = Envelope::new(&identity("b"), "x", MessageKind::Text, None, 3).with_ack();
        assert_eq!(env.relay_key(), env.id);

        let mut retry = env.clone();
        retry.attempt = 2;
        assert_ne!(retry.relay_key(), env.id);
        assert_eq!(retry.relay_key().as_str(), format!("{}#2", env.id));
        assert_eq!(retry.relay_copy(&DeviceId::new("a")).unwrap().attempt, 2);

        let json: serde_json::Value = serde_json::from_slice(&retry.encode().unwrap()).unwrap();
        assert_eq!(json["attempt"], 2);
        let first: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert!(first.get("attempt").is_none());
    }

    #[test]
    fn test_targeted_envelope_addressing() {
        let env = Envelope::new(
            &identity("b"),
            "for c",
            MessageKind::Text,
            Some(DeviceId::new("c")),
            5,
        );
        assert!(!env.is_broadcast());
        assert!(env.is_addressed_to(&DeviceId::new("c")));
        assert!(!env.is_addressed_to(&DeviceId::new("a")));
    }

    #[test]
    fn test_wire_keys_are_camel_case() {
        let env = Envelope::new(&identity("b"), "hi", MessageKind::Sos, None, 5)
            .with_location(12.5, -70.25);
        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["senderId"], "b");
        assert_eq!(json["senderName"], "b name");
        assert_eq!(json["kind"], "sos");
        assert_eq!(json["ttl"], 5);
        assert_eq!(json["routePath"][0], "b");
        assert_eq!(json["lat"], 12.5);
        assert!(json.get("targetDeviceId").is_none());
        assert!(json.get("requiresAck").is_none());
        assert!(json["timestampMillis"].is_i64());
    }

    #[test]
    fn test_roundtrip_with_optional_fields() {
        let env = Envelope::new(
            &identity("b"),
            "target me",
            MessageKind::Location,
            Some(DeviceId::new("a")),
            4,
        )
        .with_location(-33.8688, 151.2093)
        .with_ack();
        let decoded = WireMessage::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, WireMessage::Message(env));
    }

    #[test]
    fn test_control_frames_roundtrip() {
        let frames = vec![
            WireMessage::Handshake {
                device_id: DeviceId::new("a"),
                device_name: "Alpha".into(),
            },
            WireMessage::Ping {
                seq: 42,
                sent_at_millis: 1_700_000_000_000,
                device_id: DeviceId::new("a"),
            },
            WireMessage::Ack {
                envelope_id: EnvelopeId::from("b:01"),
                device_id: DeviceId::new("a"),
                return_path: vec![DeviceId::new("b")],
            },
        ];
        for frame in frames {
            let bytes = frame.encode().unwrap();
            assert_eq!(WireMessage::decode(&bytes).unwrap(), frame);
            assert!(!frame.is_envelope());
        }
    }

    #[test]
    fn test_ping_wire_shape() {
        let frame = WireMessage::Pong {
            seq: 9,
            sent_at_millis: 5,
            device_id: DeviceId::new("x"),
        };
        let json: serde_json::Value = serde_json::from_slice(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "pong");
        assert_eq!(json["seq"], 9);
        assert_eq!(json["sentAtMillis"], 5);
        assert_eq!(json["deviceId"], "x");
    }

    #[test]
    fn test_unknown_type_is_protocol_violation() {
        let err = WireMessage::decode(br#"{"type":"telemetry","deviceId":"a"}"#).unwrap_err();
        assert!(matches!(err, MeshError::Protocol(_)));
    }

    #[test]
    fn test_garbage_is_protocol_violation() {
        assert!(matches!(
            WireMessage::decode(b"\x00\x01not json"),
            Err(MeshError::Protocol(_))
        ));
    }

    #[test]
    fn test_missing_required_key_rejected() {
        let err = WireMessage::decode(br#"{"type":"message","id":"x","body":"hi"}"#);
        assert!(err.is_err());
    }
}
