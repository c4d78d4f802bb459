//! Mesh message engine
//!
//! Originates, accepts, delivers and relays envelopes over whatever links the
//! connection layer has established.
//!
//! ## Receive path
//!
//! ```text
//! envelope ──► (id, attempt) seen? ──yes──► drop (re-ack if it wants one)
//!                 │no
//!                 ▼
//!          route path names us? ──yes──► drop (loop)
//!                 │no
//!                 ▼
//!          id seen on an earlier attempt? ──yes──► re-ack or relay only
//!                 │no
//!                 ▼
//!          mark processed ─► persist ─► deliver if addressed here
//!                 │
//!                 ▼
//!          relay copy (ttl - 1, path + us) to every link except the
//!          sender and devices already on the path
//! ```
//!
//! Envelopes addressed to this device are never relayed. When the target of
//! a relayed envelope is directly linked, only that link gets it.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::ack::{AckDecision, AckTracker};
use crate::config::MessagingConfig;
use crate::dedup::ProcessedIdSet;
use crate::envelope::{Envelope, WireMessage};
use crate::error::MeshResult;
use crate::events::MeshEvent;
use crate::links::{Link, LinkTable};
use crate::queue::{QueueTarget, StoreForwardQueue};
use crate::storage::{EnvelopeOrigin, EnvelopeStore};
use crate::transport::DriverSet;
use crate::types::{now_millis, DeviceId, EnvelopeId, LocalIdentity, MessageKind, TransportKind};

/// A message the application wants to send
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: String,
    pub kind: MessageKind,
    /// `None` broadcasts to every device
    pub target: Option<DeviceId>,
    /// Hop budget; the configured default when absent
    pub ttl: Option<u8>,
    pub location: Option<(f64, f64)>,
    pub requires_ack: bool,
    /// Caller-chosen id, for idempotent resends
    pub id: Option<EnvelopeId>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            body: body.into(),
            kind,
            target: None,
            ttl: None,
            location: None,
            requires_ack: false,
            id: None,
        }
    }

    /// Plain text broadcast
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(body, MessageKind::Text)
    }

    pub fn to(mut self, target: impl Into<DeviceId>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn location(mut self, lat: f64, lon: f64) -> Self {
        self.location = Some((lat, lon));
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    pub fn with_id(mut self, id: EnvelopeId) -> Self {
        self.id = Some(id);
        self
    }
}

/// Counters kept by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Envelopes originated here
    pub sent: u64,
    /// Envelopes delivered to the local application
    pub delivered: u64,
    /// Relay copies handed to links
    pub forwarded: u64,
    pub duplicates_dropped: u64,
    pub loops_dropped: u64,
    /// Envelopes whose hop budget ran out here
    pub ttl_expired: u64,
    pub queued: u64,
    /// Queued envelopes handed to a link later
    pub flushed: u64,
    pub queue_expired: u64,
    pub protocol_violations: u64,
    pub beacons_sent: u64,
    pub delivery_failures: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub retries: u64,
    /// Frames a driver accepted
    pub frames_sent: u64,
    /// Frames a driver rejected
    pub send_failures: u64,
}

/// What happened to an inbound envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Duplicate,
    Looped,
    Accepted { delivered: bool, forwarded: usize },
}

/// Envelope origination, acceptance, relay and store-and-forward
pub struct MessageEngine {
    identity: LocalIdentity,
    config: MessagingConfig,
    drivers: Arc<DriverSet>,
    links: Arc<LinkTable>,
    store: Arc<dyn EnvelopeStore>,
    events: broadcast::Sender<MeshEvent>,
    processed: Mutex<ProcessedIdSet>,
    queue: Mutex<StoreForwardQueue>,
    acks: Mutex<AckTracker>,
    stats: Mutex<EngineStats>,
}

impl MessageEngine {
    pub fn new(
        identity: LocalIdentity,
        config: MessagingConfig,
        drivers: Arc<DriverSet>,
        links: Arc<LinkTable>,
        store: Arc<dyn EnvelopeStore>,
        events: broadcast::Sender<MeshEvent>,
    ) -> Self {
        let processed = ProcessedIdSet::new(config.processed_expiry());
        let queue = StoreForwardQueue::new(
            config.queue_max_age_ms as i64,
            config.queue_retry_ceiling,
        );
        let acks = AckTracker::new(
            config.ack_timeout(),
            config.ack_max_retries,
            config.ack_backoff_cap(),
        );
        Self {
            identity,
            config,
            drivers,
            links,
            store,
            events,
            processed: Mutex::new(processed),
            queue: Mutex::new(queue),
            acks: Mutex::new(acks),
            stats: Mutex::new(EngineStats::default()),
        }
    }

    fn me(&self) -> &DeviceId {
        &self.identity.device_id
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().clone()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().pending_count()
    }

    pub fn pending_acks(&self) -> usize {
        self.acks.lock().len()
    }

    /// Whether an envelope id is inside the dedup window
    pub fn has_processed(&self, id: &EnvelopeId) -> bool {
        self.processed.lock().contains(id)
    }

    pub fn note_protocol_violation(&self) {
        self.stats.lock().protocol_violations += 1;
    }

    pub fn note_beacon_sent(&self) {
        self.stats.lock().beacons_sent += 1;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outbound
    // ═══════════════════════════════════════════════════════════════════════

    /// Originate an envelope
    ///
    /// The envelope is persisted before anything goes on the air; a storage
    /// failure aborts the send. With no link able to take it, the envelope
    /// is queued instead.
    pub async fn send(&self, message: OutboundMessage) -> MeshResult<Envelope> {
        let ttl = message
            .ttl
            .unwrap_or(self.config.default_ttl)
            .clamp(1, self.config.max_ttl.max(1));
        let mut envelope = Envelope::new(
            &self.identity,
            message.body,
            message.kind,
            message.target,
            ttl,
        );
        if let Some(id) = message.id {
            envelope = envelope.with_id(id);
        }
        if let Some((lat, lon)) = message.location {
            envelope = envelope.with_location(lat, lon);
        }
        if message.requires_ack && envelope.target_device_id.is_some() {
            envelope = envelope.with_ack();
        }

        self.store.save_envelope(&envelope, EnvelopeOrigin::Local)?;
        self.processed
            .lock()
            .insert(envelope.id.clone(), Instant::now());
        self.stats.lock().sent += 1;

        let handed_off = self.transmit_envelope(&envelope).await?;
        tracing::info!(
            envelope_id = %envelope.id,
            kind = ?envelope.kind,
            ttl,
            target = ?envelope.target_device_id,
            handed_off,
            "Originated envelope"
        );

        if handed_off > 0 {
            self.mark_delivered(&envelope.id);
        } else {
            self.enqueue(&envelope, now_millis());
        }

        if envelope.requires_ack {
            self.acks.lock().track(envelope.clone(), Instant::now());
        }
        Ok(envelope)
    }

    /// Hand an originated envelope to the links; returns how many took it
    async fn transmit_envelope(&self, envelope: &Envelope) -> MeshResult<usize> {
        let targets = match envelope
            .target_device_id
            .as_ref()
            .and_then(|t| self.links.get(t))
        {
            Some(direct) => vec![direct],
            None => self.links.all(),
        };
        if targets.is_empty() {
            return Ok(0);
        }
        let payload = Bytes::from(envelope.encode()?);
        Ok(self.fan_out(&targets, payload).await)
    }

    fn enqueue(&self, envelope: &Envelope, enqueued_at: i64) {
        let targets = match &envelope.target_device_id {
            Some(target) => vec![QueueTarget::Device(target.clone())],
            None => {
                let known = self.links.known_devices();
                if known.is_empty() {
                    vec![QueueTarget::AnyPeer]
                } else {
                    known.into_iter().map(QueueTarget::Device).collect()
                }
            }
        };
        let mut added = 0;
        {
            let mut queue = self.queue.lock();
            for target in targets {
                if queue.enqueue(envelope.clone(), target, enqueued_at) {
                    added += 1;
                }
            }
        }
        if added > 0 {
            self.stats.lock().queued += 1;
        }
    }

    fn mark_delivered(&self, id: &EnvelopeId) {
        if let Err(e) = self.store.mark_delivered(id) {
            tracing::warn!(envelope_id = %id, error = %e, "Failed to mark envelope delivered");
        }
    }

    /// Send one frame to several links at once; returns how many accepted it
    async fn fan_out(&self, links: &[Link], payload: Bytes) -> usize {
        let sends = links.iter().map(|link| self.transmit(link, payload.clone()));
        join_all(sends).await.into_iter().filter(|ok| *ok).count()
    }

    /// Send one frame on one link
    pub(crate) async fn transmit(&self, link: &Link, payload: Bytes) -> bool {
        let Some(driver) = self.drivers.get(link.transport) else {
            tracing::warn!(transport = %link.transport, "No driver for link");
            self.stats.lock().send_failures += 1;
            return false;
        };
        match driver.send_bytes(&link.address, payload).await {
            Ok(()) => {
                self.stats.lock().frames_sent += 1;
                true
            }
            Err(e) => {
                tracing::warn!(
                    peer = %link.device_id,
                    transport = %link.transport,
                    error = %e,
                    "Send failed"
                );
                self.stats.lock().send_failures += 1;
                false
            }
        }
    }

    /// Send a control frame to one link
    pub async fn send_frame(&self, link: &Link, frame: &WireMessage) -> MeshResult<bool> {
        let payload = Bytes::from(frame.encode()?);
        Ok(self.transmit(link, payload).await)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound
    // ═══════════════════════════════════════════════════════════════════════

    /// Accept an envelope that arrived from `from_address` over `transport`
    pub async fn receive(
        &self,
        transport: TransportKind,
        from_address: &str,
        envelope: Envelope,
    ) -> ReceiveOutcome {
        let me = self.me().clone();
        let addressed_here = envelope.target_device_id.as_ref() == Some(&me);

        let now = Instant::now();
        let fresh = self.processed.lock().insert(envelope.relay_key(), now);
        if !fresh {
            tracing::trace!(envelope_id = %envelope.id, "Duplicate envelope dropped");
            self.stats.lock().duplicates_dropped += 1;
            if addressed_here && envelope.requires_ack {
                self.send_ack(&envelope).await;
            }
            return ReceiveOutcome::Duplicate;
        }

        if envelope.has_traversed(&me) {
            tracing::debug!(envelope_id = %envelope.id, "Envelope looped back, dropped");
            self.stats.lock().loops_dropped += 1;
            return ReceiveOutcome::Looped;
        }

        // A retry of an id we already handled is only passed along
        let first_copy =
            envelope.attempt == 0 || self.processed.lock().insert(envelope.id.clone(), now);
        if !first_copy {
            tracing::debug!(envelope_id = %envelope.id, attempt = envelope.attempt, "Retry of a known envelope");
            if addressed_here && envelope.requires_ack {
                self.send_ack(&envelope).await;
            }
            let forwarded = if addressed_here {
                0
            } else {
                self.relay(transport, from_address, &envelope).await
            };
            return ReceiveOutcome::Accepted {
                delivered: false,
                forwarded,
            };
        }

        if let Err(e) = self.store.save_envelope(&envelope, EnvelopeOrigin::Remote) {
            tracing::warn!(envelope_id = %envelope.id, error = %e, "Failed to persist inbound envelope");
        }

        let delivered = envelope.is_addressed_to(&me);
        if delivered {
            tracing::info!(
                envelope_id = %envelope.id,
                from = %envelope.sender_id,
                hops = envelope.route_path.len(),
                "Delivered envelope"
            );
            self.stats.lock().delivered += 1;
            let _ = self.events.send(MeshEvent::EnvelopeDelivered(envelope.clone()));
            if addressed_here && envelope.requires_ack {
                self.send_ack(&envelope).await;
            }
        }

        let forwarded = if addressed_here {
            0
        } else {
            self.relay(transport, from_address, &envelope).await
        };

        ReceiveOutcome::Accepted {
            delivered,
            forwarded,
        }
    }

    async fn relay(&self, transport: TransportKind, from_address: &str, envelope: &Envelope) -> usize {
        let Some(copy) = envelope.relay_copy(self.me()) else {
            tracing::debug!(envelope_id = %envelope.id, ttl = envelope.ttl, "Hop budget spent, not relaying");
            self.stats.lock().ttl_expired += 1;
            return 0;
        };

        let eligible = |link: &Link| {
            !link.is_at(transport, from_address) && !copy.has_traversed(&link.device_id)
        };
        let direct = copy
            .target_device_id
            .as_ref()
            .and_then(|t| self.links.get(t))
            .filter(|link| eligible(link));
        let targets = match direct {
            Some(link) => vec![link],
            None => self
                .links
                .all()
                .into_iter()
                .filter(|link| eligible(link))
                .collect::<Vec<_>>(),
        };
        if targets.is_empty() {
            return 0;
        }

        let payload = match copy.encode() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                tracing::warn!(envelope_id = %copy.id, error = %e, "Failed to encode relay copy");
                return 0;
            }
        };
        let forwarded = self.fan_out(&targets, payload).await;
        self.stats.lock().forwarded += forwarded as u64;
        tracing::debug!(envelope_id = %copy.id, ttl = copy.ttl, forwarded, "Relayed envelope");
        forwarded
    }

    /// Accept an envelope pulled from the cloud; never relayed
    ///
    /// Returns true when the envelope was new here.
    pub fn ingest_synced(&self, envelope: Envelope) -> bool {
        let fresh = self
            .processed
            .lock()
            .insert(envelope.id.clone(), Instant::now());
        if !fresh {
            return false;
        }
        if let Err(e) = self.store.save_envelope(&envelope, EnvelopeOrigin::Remote) {
            tracing::warn!(envelope_id = %envelope.id, error = %e, "Failed to persist synced envelope");
        }
        if envelope.sender_id != *self.me() && envelope.is_addressed_to(self.me()) {
            self.stats.lock().delivered += 1;
            let _ = self.events.send(MeshEvent::EnvelopeDelivered(envelope));
        }
        true
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Acknowledgments
    // ═══════════════════════════════════════════════════════════════════════

    async fn send_ack(&self, envelope: &Envelope) {
        let frame = WireMessage::Ack {
            envelope_id: envelope.id.clone(),
            device_id: self.me().clone(),
            return_path: envelope.route_path.clone(),
        };
        if self.route_ack(frame).await {
            self.stats.lock().acks_sent += 1;
        }
    }

    /// Pass an ack one hop further back along its return path
    async fn route_ack(&self, frame: WireMessage) -> bool {
        let WireMessage::Ack {
            envelope_id,
            device_id,
            mut return_path,
        } = frame
        else {
            return false;
        };
        while return_path.last() == Some(self.me()) {
            return_path.pop();
        }
        let Some(next) = return_path.last().cloned() else {
            return false;
        };
        let Some(link) = self.links.get(&next) else {
            tracing::debug!(envelope_id = %envelope_id, next = %next, "No link toward ack's next hop");
            return false;
        };
        let frame = WireMessage::Ack {
            envelope_id,
            device_id,
            return_path,
        };
        match self.send_frame(&link, &frame).await {
            Ok(sent) => sent,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode ack");
                false
            }
        }
    }

    /// Handle an inbound ack frame
    pub async fn on_ack(&self, envelope_id: EnvelopeId, by: DeviceId, return_path: Vec<DeviceId>) {
        if return_path.first() == Some(self.me()) && return_path.len() <= 1 {
            let known = self.acks.lock().acknowledge(&envelope_id);
            if known {
                tracing::info!(envelope_id = %envelope_id, by = %by, "Delivery confirmed");
                self.stats.lock().acks_received += 1;
                self.mark_delivered(&envelope_id);
                let _ = self.events.send(MeshEvent::DeliveryConfirmed { envelope_id, by });
            }
            return;
        }
        let frame = WireMessage::Ack {
            envelope_id,
            device_id: by,
            return_path,
        };
        self.route_ack(frame).await;
    }

    /// Resend overdue envelopes and give up on exhausted ones
    pub async fn check_acks(&self) {
        let decisions = self.acks.lock().check(Instant::now());
        for decision in decisions {
            match decision {
                AckDecision::Retry(envelope) => {
                    self.stats.lock().retries += 1;
                    self.processed
                        .lock()
                        .insert(envelope.relay_key(), Instant::now());
                    tracing::debug!(envelope_id = %envelope.id, attempt = envelope.attempt, "Retrying unacknowledged envelope");
                    match self.transmit_envelope(&envelope).await {
                        Ok(0) => {
                            self.enqueue(&envelope, envelope.timestamp_millis);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(envelope_id = %envelope.id, error = %e, "Retry failed");
                        }
                    }
                }
                AckDecision::Failed(envelope_id) => {
                    self.stats.lock().delivery_failures += 1;
                    let _ = self.events.send(MeshEvent::DeliveryFailed { envelope_id });
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Store-and-forward
    // ═══════════════════════════════════════════════════════════════════════

    /// Re-queue envelopes the store still reports as pending
    pub fn restore_queue(&self) -> MeshResult<usize> {
        let pending = self.store.get_pending_envelopes()?;
        let now = Instant::now();
        let count = pending.len();
        for envelope in pending {
            self.processed.lock().insert(envelope.id.clone(), now);
            self.enqueue(&envelope, envelope.timestamp_millis);
        }
        if count > 0 {
            tracing::info!(count, "Restored queued envelopes from store");
        }
        Ok(count)
    }

    /// A device just completed its handshake; hand it whatever waits for it
    ///
    /// Runs the full sweep: stale entries are purged first, and targets that
    /// the new link only reaches through the mesh get their turn too.
    pub async fn on_peer_linked(&self, device: &DeviceId) -> usize {
        tracing::debug!(device = %device, "Peer linked, flushing queue");
        self.flush_queue().await
    }

    /// Periodic sweep: purge stale entries, then flush every reachable target
    pub async fn flush_queue(&self) -> usize {
        let expired = self.queue.lock().expire(now_millis());
        if expired > 0 {
            self.stats.lock().queue_expired += expired as u64;
        }
        let targets = self.queue.lock().targets();
        let mut flushed = 0;
        for target in targets {
            flushed += self.flush_target(target).await;
        }
        flushed
    }

    async fn flush_target(&self, target: QueueTarget) -> usize {
        let links = match &target {
            // Not in range: flood and let the mesh carry it
            QueueTarget::Device(device) => match self.links.get(device) {
                Some(direct) => vec![direct],
                None => self.links.all(),
            },
            QueueTarget::AnyPeer => self.links.all(),
        };
        if links.is_empty() {
            return 0;
        }
        let entries = self.queue.lock().take(&target);
        if entries.is_empty() {
            return 0;
        }

        let mut flushed = 0;
        for mut entry in entries {
            let payload = match entry.envelope.encode() {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    tracing::warn!(envelope_id = %entry.envelope.id, error = %e, "Dropping unencodable queued envelope");
                    continue;
                }
            };
            if self.fan_out(&links, payload).await > 0 {
                flushed += 1;
                self.mark_delivered(&entry.envelope.id);
            } else {
                entry.attempts += 1;
                self.queue.lock().requeue(target.clone(), entry);
            }
        }
        if flushed > 0 {
            tracing::info!(target = %target, flushed, "Flushed queued envelopes");
            self.stats.lock().flushed += flushed as u64;
        }
        flushed
    }

    /// Forget processed ids past the dedup window
    pub fn sweep_processed(&self) -> usize {
        self.processed.lock().sweep(Instant::now())
    }
}
