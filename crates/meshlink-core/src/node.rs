//! MeshNode: one device's engine, wired together
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │ MeshNode                                                          │
//! │                                                                   │
//! │  drivers ──► pump:<transport> ──► frame dispatch                  │
//! │                 │                   ├── Message   → MessageEngine │
//! │                 │                   ├── Handshake → LinkTable     │
//! │                 │                   ├── Ping/Pong → keep-alive    │
//! │                 │                   ├── Ack       → MessageEngine │
//! │                 │                   └── Beacon    → MeshEvent     │
//! │                 ├── scan results ──► Discovery ──► PeerRegistry   │
//! │                 └── link up/down ──► ConnectionManager            │
//! │                                                                   │
//! │  Scheduler: discovery, keepalive, queue-flush, processed-sweep,   │
//! │             ack-check, recovery, sync                             │
//! │                                                                   │
//! │  events: broadcast::Sender<MeshEvent> → application               │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Background tasks hold only a `Weak` handle to the node, so dropping the
//! last `Arc` (or calling [`MeshNode::dispose`]) stops everything.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::config::MeshConfig;
use crate::connection::{ConnectionDeps, ConnectionManager, RecoveryTier};
use crate::discovery::{Discovery, DiscoveryOutcome};
use crate::envelope::{Envelope, WireMessage};
use crate::error::{MeshError, MeshResult};
use crate::events::{MeshEvent, MeshStatus};
use crate::links::{Link, LinkTable};
use crate::messaging::{EngineStats, MessageEngine, OutboundMessage};
use crate::peers::{PeerRecord, PeerRegistry};
use crate::role::RoleArbitrator;
use crate::scheduler::Scheduler;
use crate::storage::{EnvelopeStore, MemoryStore};
use crate::sync::{SyncBridge, SyncDriver, SyncReport};
use crate::transport::{CapabilityDescriptor, DriverEvent, DriverSet, TransportDriver};
use crate::types::{DeviceId, ForcedRole, LocalIdentity, Role, TransportKind};

/// Capacity of the application event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Assembles a [`MeshNode`]
pub struct MeshNodeBuilder {
    config: MeshConfig,
    identity: LocalIdentity,
    drivers: Vec<Arc<dyn TransportDriver>>,
    store: Option<Arc<dyn EnvelopeStore>>,
    sync: Option<Arc<dyn SyncBridge>>,
}

impl MeshNodeBuilder {
    /// Start from a configuration; a missing device id is generated here
    pub fn new(config: MeshConfig) -> Self {
        let device_id = config
            .device_id
            .clone()
            .map(DeviceId::new)
            .unwrap_or_else(DeviceId::generate);
        let name = config
            .device_name
            .clone()
            .unwrap_or_else(|| device_id.to_string());
        Self {
            identity: LocalIdentity::new(device_id, name),
            config,
            drivers: Vec::new(),
            store: None,
            sync: None,
        }
    }

    /// The identity the node will run under
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn driver(mut self, driver: Arc<dyn TransportDriver>) -> Self {
        self.drivers.push(driver);
        self
    }

    /// Persistence; an in-memory store when never set
    pub fn store(mut self, store: Arc<dyn EnvelopeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sync_bridge(mut self, bridge: Arc<dyn SyncBridge>) -> Self {
        self.sync = Some(bridge);
        self
    }

    pub fn build(self) -> MeshResult<Arc<MeshNode>> {
        self.config.validate()?;
        if self.drivers.is_empty() {
            return Err(MeshError::NoDriver("no transport drivers registered".into()));
        }

        let mut set = DriverSet::new();
        for driver in self.drivers {
            set.register(driver)?;
        }
        let drivers = Arc::new(set);
        let capabilities = Arc::new(CapabilityDescriptor::negotiate(&drivers));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn EnvelopeStore>);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let registry = Arc::new(PeerRegistry::new());
        let links = Arc::new(LinkTable::new());
        let discovery = Arc::new(Discovery::new(
            drivers.clone(),
            capabilities.clone(),
            registry.clone(),
            self.config.discovery.clone(),
            events.clone(),
        ));
        let engine = Arc::new(MessageEngine::new(
            self.identity.clone(),
            self.config.messaging.clone(),
            drivers.clone(),
            links.clone(),
            store.clone(),
            events.clone(),
        ));
        let scheduler = Scheduler::new();
        let manager = Arc::new(ConnectionManager::new(
            self.identity.clone(),
            self.config.connection.clone(),
            RoleArbitrator::new(&self.config.arbitration),
            ConnectionDeps {
                drivers: drivers.clone(),
                capabilities: capabilities.clone(),
                discovery: discovery.clone(),
                links: links.clone(),
                engine: engine.clone(),
                store: store.clone(),
                events: events.clone(),
            },
            scheduler.child_token(),
        ));
        let sync = self
            .sync
            .map(|bridge| SyncDriver::new(bridge, store.clone(), engine.clone(), events.clone()));

        tracing::info!(
            device_id = %self.identity.device_id,
            name = %self.identity.display_name,
            drivers = drivers.len(),
            "Mesh node built"
        );

        Ok(Arc::new(MeshNode {
            identity: self.identity,
            config: self.config,
            drivers,
            capabilities,
            registry,
            discovery,
            links,
            engine,
            manager,
            sync,
            events,
            scheduler,
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }))
    }
}

/// A running mesh device
pub struct MeshNode {
    identity: LocalIdentity,
    config: MeshConfig,
    drivers: Arc<DriverSet>,
    capabilities: Arc<CapabilityDescriptor>,
    registry: Arc<PeerRegistry>,
    discovery: Arc<Discovery>,
    links: Arc<LinkTable>,
    engine: Arc<MessageEngine>,
    manager: Arc<ConnectionManager>,
    sync: Option<SyncDriver>,
    events: broadcast::Sender<MeshEvent>,
    scheduler: Scheduler,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl MeshNode {
    pub fn builder(config: MeshConfig) -> MeshNodeBuilder {
        MeshNodeBuilder::new(config)
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.identity.device_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    fn ensure_live(&self) -> MeshResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(MeshError::Disposed)
        } else {
            Ok(())
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Start pumps, timers, queue restore and an immediate establish
    pub fn start(self: &Arc<Self>) -> MeshResult<()> {
        if !self.start_manual()? {
            return Ok(());
        }
        self.spawn_timers();

        let weak = Arc::downgrade(self);
        self.scheduler.spawn("bootstrap", async move {
            if let Some(node) = weak.upgrade() {
                if let Err(e) = node.establish().await {
                    tracing::warn!(error = %e, "Initial establish failed");
                }
            }
        });
        Ok(())
    }

    /// Start only the driver pumps and queue restore
    ///
    /// Timers stay off; callers drive discovery, keep-alive and sweeps by
    /// hand. Returns false when the node was already started.
    pub fn start_manual(self: &Arc<Self>) -> MeshResult<bool> {
        self.ensure_live()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        for driver in self.drivers.iter() {
            self.spawn_pump(driver.clone());
        }
        self.engine.restore_queue()?;
        tracing::info!(device_id = %self.identity.device_id, "Mesh node started");
        Ok(true)
    }

    fn spawn_pump(self: &Arc<Self>, driver: Arc<dyn TransportDriver>) {
        let kind = driver.kind();
        let mut rx = driver.subscribe();
        let weak = Arc::downgrade(self);
        self.scheduler.spawn(format!("pump:{}", kind), async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(node) = weak.upgrade() else { break };
                        node.handle_driver_event(kind, event).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(transport = %kind, missed, "Driver events lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!(transport = %kind, "Driver pump stopped");
        });
    }

    /// Run `job` on a timer for as long as the node lives
    fn every<I, J, Fut>(self: &Arc<Self>, name: &str, interval: I, job: J)
    where
        I: Fn(&MeshNode) -> Duration + Send + 'static,
        J: Fn(Arc<MeshNode>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fallback = interval(&**self);
        let for_interval: Weak<MeshNode> = Arc::downgrade(self);
        let for_job: Weak<MeshNode> = Arc::downgrade(self);
        let job = Arc::new(job);
        self.scheduler.spawn_periodic(
            name,
            move || {
                for_interval
                    .upgrade()
                    .map(|node| interval(&*node))
                    .unwrap_or(fallback)
            },
            move || {
                let node = for_job.upgrade();
                let job = job.clone();
                async move {
                    if let Some(node) = node {
                        job(node).await;
                    }
                }
            },
        );
    }

    fn spawn_timers(self: &Arc<Self>) {
        self.every(
            "discovery",
            |n| n.config.discovery.sweep_interval(),
            |node| async move {
                node.discover(false).await;
            },
        );
        self.every(
            "keepalive",
            |n| n.config.connection.keepalive_interval(),
            |node| async move { node.keepalive_tick().await },
        );
        self.every(
            "queue-flush",
            |n| n.config.messaging.queue_flush_interval(),
            |node| async move {
                node.flush_queue().await;
            },
        );
        self.every(
            "processed-sweep",
            |n| n.config.messaging.processed_sweep_interval(),
            |node| async move {
                node.sweep_processed();
            },
        );
        self.every(
            "ack-check",
            |n| n.config.messaging.ack_check_interval(),
            |node| async move { node.check_acks().await },
        );
        self.every(
            "recovery",
            |n| n.manager.retry_interval(),
            |node| async move {
                if let Err(e) = node.manager.recover().await {
                    tracing::warn!(error = %e, "Recovery round failed");
                }
            },
        );
        if self.sync.is_some() {
            self.every(
                "sync",
                |n| n.config.sync.interval(),
                |node| async move {
                    if let Err(e) = node.sync_now().await {
                        tracing::warn!(error = %e, "Sync round failed");
                    }
                },
            );
        }
    }

    /// Cancel every task and drop the session; later calls do nothing
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(device_id = %self.identity.device_id, "Disposing mesh node");
        self.scheduler.shutdown();
        self.manager.dispose().await;
        for driver in self.drivers.iter() {
            if let Err(e) = driver.stop_discovery().await {
                tracing::debug!(transport = %driver.kind(), error = %e, "Stop discovery failed");
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn task_names(&self) -> Vec<String> {
        self.scheduler.task_names()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Driver events
    // ═══════════════════════════════════════════════════════════════════════

    async fn handle_driver_event(&self, kind: TransportKind, event: DriverEvent) {
        match event {
            DriverEvent::PeersDiscovered { peers } => self.discovery.on_snapshot(kind, peers),
            DriverEvent::DiscoveryFinished => self.discovery.on_finished(kind),
            DriverEvent::PeerLost { address } => self.discovery.on_peer_lost(kind, &address),
            DriverEvent::ConnectionStateChanged {
                address: Some(address),
                connected: true,
            } => {
                tracing::debug!(peer = %address, transport = %kind, "Link up");
                let handshake = WireMessage::Handshake {
                    device_id: self.identity.device_id.clone(),
                    device_name: self.identity.display_name.clone(),
                };
                if let Err(e) = self.send_raw(kind, &address, &handshake).await {
                    tracing::warn!(peer = %address, error = %e, "Handshake failed");
                }
                self.manager.on_link_up(kind, &address);
            }
            DriverEvent::ConnectionStateChanged {
                address,
                connected: false,
            } => {
                if let Some(address) = address.as_deref() {
                    if let Some(link) = self.links.remove_by_address(kind, address) {
                        tracing::info!(peer = %link.device_id, transport = %kind, "Peer disconnected");
                        let _ = self.events.send(MeshEvent::PeerDisconnected {
                            device_id: link.device_id,
                        });
                    }
                }
                self.manager.on_link_down(kind, address.as_deref()).await;
            }
            DriverEvent::ConnectionStateChanged {
                address: None,
                connected: true,
            } => {}
            DriverEvent::BytesReceived { from, payload } => {
                self.handle_frame(kind, &from, &payload).await
            }
            DriverEvent::Error { message } => self.manager.on_driver_error(kind, &message).await,
        }
    }

    async fn handle_frame(&self, kind: TransportKind, from: &str, payload: &[u8]) {
        let frame = match WireMessage::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(peer = %from, transport = %kind, error = %e, "Discarding malformed frame");
                self.engine.note_protocol_violation();
                return;
            }
        };
        tracing::trace!(peer = %from, frame = frame.type_name(), "Frame received");

        match frame {
            WireMessage::Message(envelope) => {
                self.links.touch(kind, from);
                self.engine.receive(kind, from, envelope).await;
            }
            WireMessage::Handshake {
                device_id,
                device_name,
            } => self.on_handshake(kind, from, device_id, device_name).await,
            WireMessage::Heartbeat { .. } => self.links.touch(kind, from),
            WireMessage::Ping {
                seq,
                sent_at_millis,
                ..
            } => {
                self.links.touch(kind, from);
                let pong = WireMessage::Pong {
                    seq,
                    sent_at_millis,
                    device_id: self.identity.device_id.clone(),
                };
                if let Err(e) = self.send_raw(kind, from, &pong).await {
                    tracing::debug!(peer = %from, error = %e, "Pong failed");
                }
            }
            WireMessage::Pong { seq, .. } => {
                self.links.touch(kind, from);
                self.manager.on_pong(seq);
            }
            WireMessage::Ack {
                envelope_id,
                device_id,
                return_path,
            } => self.engine.on_ack(envelope_id, device_id, return_path).await,
            WireMessage::Beacon {
                device_id,
                device_name,
                emergency,
            } => {
                if emergency && device_id != self.identity.device_id {
                    tracing::warn!(from = %device_id, "Emergency beacon received");
                    let _ = self.events.send(MeshEvent::EmergencyBeacon {
                        device_id,
                        display_name: device_name,
                    });
                }
            }
        }
    }

    async fn on_handshake(
        &self,
        kind: TransportKind,
        from: &str,
        device_id: DeviceId,
        device_name: String,
    ) {
        if device_id == self.identity.device_id {
            tracing::warn!(peer = %from, "Handshake carries our own device id, ignoring");
            self.engine.note_protocol_violation();
            return;
        }
        let fresh = self
            .links
            .insert(Link::new(device_id.clone(), device_name.clone(), kind, from));
        self.manager.on_peer_identified();
        if fresh {
            tracing::info!(peer = %device_id, name = %device_name, transport = %kind, "Peer connected");
            let _ = self.events.send(MeshEvent::PeerConnected {
                device_id: device_id.clone(),
                display_name: device_name,
                transport: kind,
            });
        }
        self.engine.on_peer_linked(&device_id).await;
    }

    async fn send_raw(&self, kind: TransportKind, address: &str, frame: &WireMessage) -> MeshResult<()> {
        let driver = self.drivers.require(kind)?;
        driver
            .send_bytes(address, Bytes::from(frame.encode()?))
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Application surface
    // ═══════════════════════════════════════════════════════════════════════

    /// Originate a message
    pub async fn send(&self, message: OutboundMessage) -> MeshResult<Envelope> {
        self.ensure_live()?;
        self.engine.send(message).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Scan for peers; escalated tiers scan every medium in parallel
    pub async fn discover(&self, force: bool) -> DiscoveryOutcome {
        let parallel = self.manager.tier() >= RecoveryTier::Aggressive;
        self.discovery.discover(force, parallel).await
    }

    /// Arbitrate and bring up a session now
    pub async fn establish(&self) -> MeshResult<Role> {
        self.ensure_live()?;
        self.manager.establish().await
    }

    pub async fn force_role(&self, forced: Option<ForcedRole>) {
        self.manager.force_role(forced).await;
    }

    pub fn set_emergency(&self, emergency: bool) {
        self.manager.set_emergency(emergency);
    }

    /// Broadcast a distress beacon on every capable medium
    pub fn send_emergency_beacon(&self) {
        self.manager.send_emergency_beacon();
    }

    pub async fn keepalive_tick(&self) {
        self.manager.keepalive_tick().await;
    }

    pub async fn flush_queue(&self) -> usize {
        self.engine.flush_queue().await
    }

    pub fn sweep_processed(&self) -> usize {
        self.engine.sweep_processed()
    }

    pub async fn check_acks(&self) {
        self.engine.check_acks().await;
    }

    /// One sync round against the bridge, if any
    pub async fn sync_now(&self) -> MeshResult<SyncReport> {
        match &self.sync {
            Some(sync) => sync.sync_once().await,
            None => Ok(SyncReport::Skipped("no sync bridge")),
        }
    }

    /// Internet came back: sync now and push out anything queued
    pub async fn connectivity_restored(&self) -> MeshResult<SyncReport> {
        self.ensure_live()?;
        let report = self.sync_now().await?;
        self.engine.flush_queue().await;
        Ok(report)
    }

    /// Tear the session down by hand
    pub async fn disconnect(&self) {
        self.manager.teardown("requested").await;
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.registry.all()
    }

    pub fn links(&self) -> Vec<Link> {
        self.links.all()
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    pub fn status(&self) -> MeshStatus {
        let state = self.manager.state();
        MeshStatus {
            device_id: self.identity.device_id.clone(),
            display_name: self.identity.display_name.clone(),
            role: state.role,
            phase: state.phase,
            connected: state.phase.is_connected(),
            transport: state.transport,
            host_address: state.host_address.clone(),
            consecutive_failures: state.consecutive_failures,
            tier: state.tier(),
            emergency: state.emergency,
            forced_role: state.forced_role,
            linked_peers: self.links.devices(),
            discovered_peers: self.registry.len(),
            queued_messages: self.engine.queued(),
            pending_acks: self.engine.pending_acks(),
            last_keepalive_ok: state.last_keepalive_ok,
            stats: self.engine.stats(),
        }
    }
}
