//! Connection manager: role, session lifecycle, keep-alive and recovery
//!
//! ## State machine
//!
//! ```text
//!   Idle ──► Discovering ──► Connecting ──► Connected ◄──► Degraded
//!    ▲                                                        │
//!    └──────────── teardown (threshold, backlog, link loss) ──┘
//! ```
//!
//! ## Recovery tiers (emergency mode only)
//!
//! | failures | tier        | behavior                                      |
//! |----------|-------------|-----------------------------------------------|
//! | 0-2      | Normal      | base retry interval                           |
//! | 3-4      | Aggressive  | retry every third of base, parallel discovery |
//! | 5+       | LastResort  | retry every sixth, host at once, beacon       |
//!
//! The failure counter survives teardown. Reaching Connected, as host or as
//! client, resets it, as do a completed handshake and an answered ping.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::discovery::Discovery;
use crate::envelope::WireMessage;
use crate::error::{MeshError, MeshResult};
use crate::events::MeshEvent;
use crate::keepalive::KeepAliveTracker;
use crate::links::{Link, LinkTable};
use crate::messaging::MessageEngine;
use crate::peers::PeerRecord;
use crate::role::{RoleArbitrator, RoleDecision};
use crate::storage::{EnvelopeStore, KnownPeerCredentials};
use crate::transport::{CapabilityDescriptor, DriverSet};
use crate::types::{now_millis, ForcedRole, LocalIdentity, Role, TransportKind};

/// Client candidates tried before falling back to hosting
const MAX_CLIENT_ATTEMPTS: usize = 2;

/// Where the session lifecycle stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Idle,
    Discovering,
    Connecting,
    Connected,
    /// Connected, but keep-alive is failing
    Degraded,
}

impl ConnectionPhase {
    /// Whether a session is up (possibly unhealthy)
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionPhase::Connected | ConnectionPhase::Degraded)
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::Discovering => "discovering",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Escalating recovery level under emergency mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryTier {
    Normal,
    Aggressive,
    LastResort,
}

impl RecoveryTier {
    pub fn from_failures(failures: u32) -> Self {
        match failures {
            0..=2 => RecoveryTier::Normal,
            3..=4 => RecoveryTier::Aggressive,
            _ => RecoveryTier::LastResort,
        }
    }

    /// Retry interval for this tier given the base interval
    pub fn retry_interval(&self, base: Duration) -> Duration {
        match self {
            RecoveryTier::Normal => base,
            RecoveryTier::Aggressive => base / 3,
            RecoveryTier::LastResort => base / 6,
        }
    }
}

impl fmt::Display for RecoveryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryTier::Normal => "normal",
            RecoveryTier::Aggressive => "aggressive",
            RecoveryTier::LastResort => "last-resort",
        };
        f.write_str(s)
    }
}

/// Snapshot of the manager's session state
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub role: Role,
    /// Medium of the active session
    pub transport: Option<TransportKind>,
    /// Host address when acting as client
    pub host_address: Option<String>,
    pub consecutive_failures: u32,
    pub emergency: bool,
    pub forced_role: Option<ForcedRole>,
    /// Unix millis of the last answered ping or completed handshake
    pub last_keepalive_ok: Option<i64>,
}

impl ConnectionState {
    fn new(config: &ConnectionConfig) -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            role: Role::None,
            transport: None,
            host_address: None,
            consecutive_failures: 0,
            emergency: config.emergency,
            forced_role: config.forced_role,
            last_keepalive_ok: None,
        }
    }

    pub fn tier(&self) -> RecoveryTier {
        if self.emergency {
            RecoveryTier::from_failures(self.consecutive_failures)
        } else {
            RecoveryTier::Normal
        }
    }
}

/// Collaborators the manager drives
pub struct ConnectionDeps {
    pub drivers: Arc<DriverSet>,
    pub capabilities: Arc<CapabilityDescriptor>,
    pub discovery: Arc<Discovery>,
    pub links: Arc<LinkTable>,
    pub engine: Arc<MessageEngine>,
    pub store: Arc<dyn EnvelopeStore>,
    pub events: broadcast::Sender<MeshEvent>,
}

struct EstablishGuard<'a>(&'a AtomicBool);

impl Drop for EstablishGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the session: arbitration, connect/host, keep-alive, teardown
pub struct ConnectionManager {
    identity: LocalIdentity,
    config: ConnectionConfig,
    arbitrator: RoleArbitrator,
    drivers: Arc<DriverSet>,
    capabilities: Arc<CapabilityDescriptor>,
    discovery: Arc<Discovery>,
    links: Arc<LinkTable>,
    engine: Arc<MessageEngine>,
    store: Arc<dyn EnvelopeStore>,
    events: broadcast::Sender<MeshEvent>,
    state: Mutex<ConnectionState>,
    keepalive: Mutex<KeepAliveTracker>,
    establishing: AtomicBool,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        identity: LocalIdentity,
        config: ConnectionConfig,
        arbitrator: RoleArbitrator,
        deps: ConnectionDeps,
        shutdown: CancellationToken,
    ) -> Self {
        let keepalive = KeepAliveTracker::new(config.ping_timeout());
        Self {
            identity,
            state: Mutex::new(ConnectionState::new(&config)),
            keepalive: Mutex::new(keepalive),
            config,
            arbitrator,
            drivers: deps.drivers,
            capabilities: deps.capabilities,
            discovery: deps.discovery,
            links: deps.links,
            engine: deps.engine,
            store: deps.store,
            events: deps.events,
            establishing: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    pub fn tier(&self) -> RecoveryTier {
        self.state.lock().tier()
    }

    /// Interval of the recovery timer under the current tier
    pub fn retry_interval(&self) -> Duration {
        self.tier().retry_interval(self.config.retry_interval())
    }

    pub fn pending_pings(&self) -> usize {
        self.keepalive.lock().pending()
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.keepalive.lock().last_rtt()
    }

    /// Apply a state change and announce it if phase or role moved
    fn update(&self, f: impl FnOnce(&mut ConnectionState)) {
        let (before, after) = {
            let mut state = self.state.lock();
            let before = (state.phase, state.role);
            f(&mut state);
            (before, (state.phase, state.role))
        };
        if before != after {
            tracing::debug!(phase = %after.0, role = %after.1, "Connection state changed");
            let _ = self.events.send(MeshEvent::StatusChanged {
                phase: after.0,
                role: after.1,
            });
        }
    }

    fn note_failure(&self, reason: &str) -> u32 {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        tracing::warn!(
            failures = state.consecutive_failures,
            tier = %state.tier(),
            reason,
            "Connection failure"
        );
        state.consecutive_failures
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Establishing a session
    // ═══════════════════════════════════════════════════════════════════════

    /// Discover, arbitrate and bring up a session
    ///
    /// Returns the resulting role. A call while another establish is in
    /// flight, or while a session is already up, returns the current role.
    pub async fn establish(&self) -> MeshResult<Role> {
        if self.establishing.swap(true, Ordering::SeqCst) {
            return Ok(self.state.lock().role);
        }
        let _guard = EstablishGuard(&self.establishing);

        let (tier, forced) = {
            let state = self.state.lock();
            if state.phase.is_connected() {
                return Ok(state.role);
            }
            (state.tier(), state.forced_role)
        };

        self.update(|s| s.phase = ConnectionPhase::Discovering);
        let escalated = tier >= RecoveryTier::Aggressive;
        let outcome = self.discovery.discover(escalated, escalated).await;
        tracing::debug!(peers = outcome.peers().len(), tier = %tier, "Discovery settled for establish");

        if tier == RecoveryTier::LastResort && forced != Some(ForcedRole::Client) {
            tracing::warn!("Last resort recovery, hosting and beaconing");
            self.become_host().await?;
            self.send_emergency_beacon();
            return Ok(Role::Host);
        }

        let known = self.known_hosts();
        match self.arbitrator.decide(forced, outcome.peers(), &known) {
            RoleDecision::Host => {
                self.become_host().await?;
                Ok(Role::Host)
            }
            RoleDecision::Client { candidates } => {
                for candidate in candidates.iter().take(MAX_CLIENT_ATTEMPTS) {
                    if self.connect_to(candidate).await {
                        return Ok(Role::Client);
                    }
                }
                if forced == Some(ForcedRole::Client) {
                    self.update(|s| s.phase = ConnectionPhase::Idle);
                    return Ok(Role::None);
                }
                tracing::info!("No candidate accepted us, hosting instead");
                self.become_host().await?;
                Ok(Role::Host)
            }
            RoleDecision::Wait => {
                tracing::debug!("Forced client with no hosts in range, waiting");
                self.update(|s| s.phase = ConnectionPhase::Idle);
                Ok(Role::None)
            }
        }
    }

    fn known_hosts(&self) -> HashSet<(TransportKind, String)> {
        match self.store.get_known_peer_credentials() {
            Ok(creds) => creds
                .into_iter()
                .map(|c| (c.transport, c.address))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read known peers");
                HashSet::new()
            }
        }
    }

    /// Create a group on the preferred hosting medium
    pub async fn become_host(&self) -> MeshResult<()> {
        let transport = self
            .capabilities
            .preferred_host()
            .ok_or_else(|| MeshError::NoDriver("no hosting-capable transport".into()))?;
        let driver = self.drivers.require(transport)?.clone();
        self.update(|s| s.phase = ConnectionPhase::Connecting);
        if let Err(e) = driver.create_group().await {
            self.note_failure("create group failed");
            self.update(|s| s.phase = ConnectionPhase::Idle);
            return Err(e);
        }
        tracing::info!(transport = %transport, "Hosting group");
        self.update(|s| {
            s.role = Role::Host;
            s.phase = ConnectionPhase::Connected;
            s.transport = Some(transport);
            s.host_address = None;
            s.consecutive_failures = 0;
        });
        Ok(())
    }

    /// Join a discovered host; false when the attempt failed
    pub async fn connect_to(&self, peer: &PeerRecord) -> bool {
        let Some(driver) = self.drivers.get(peer.transport).cloned() else {
            self.note_failure("no driver for candidate");
            return false;
        };
        self.update(|s| s.phase = ConnectionPhase::Connecting);
        tracing::info!(peer = %peer.address, transport = %peer.transport, "Connecting as client");

        match driver.connect(&peer.address).await {
            Ok(true) => {
                self.update(|s| {
                    s.role = Role::Client;
                    s.phase = ConnectionPhase::Connected;
                    s.transport = Some(peer.transport);
                    s.host_address = Some(peer.address.clone());
                    s.consecutive_failures = 0;
                });
                let credentials = KnownPeerCredentials {
                    transport: peer.transport,
                    address: peer.address.clone(),
                    device_id: peer.device_id.clone(),
                    display_name: peer.display_name.clone(),
                    saved_at: now_millis(),
                };
                if let Err(e) = self.store.save_known_peer_credentials(&credentials) {
                    tracing::warn!(error = %e, "Failed to save host credentials");
                }
                true
            }
            Ok(false) => {
                self.note_failure("connect refused");
                false
            }
            Err(e) => {
                tracing::warn!(peer = %peer.address, error = %e, "Connect failed");
                self.note_failure("connect error");
                false
            }
        }
    }

    /// Periodic re-evaluation
    ///
    /// An idle device tries to establish. A host nobody joined merges into
    /// a visible host whose device id sorts lower, so two lonely hosts do not
    /// wait on each other forever.
    pub async fn recover(&self) -> MeshResult<()> {
        let (phase, role, forced) = {
            let s = self.state.lock();
            (s.phase, s.role, s.forced_role)
        };
        if phase == ConnectionPhase::Idle {
            self.establish().await?;
            return Ok(());
        }
        if role != Role::Host || forced == Some(ForcedRole::Host) || !self.links.is_empty() {
            return Ok(());
        }

        let outcome = self.discovery.discover(false, false).await;
        let me = self.identity.device_id.as_str();
        let other_host = outcome
            .peers()
            .iter()
            .filter(|p| p.available && p.is_host)
            .find(|p| p.device_id.as_ref().is_some_and(|d| d.as_str() < me))
            .cloned();
        if let Some(host) = other_host {
            tracing::info!(host = %host.address, "Lonely host joining another group");
            self.teardown("merging into another group").await;
            if !self.connect_to(&host).await {
                self.become_host().await?;
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Link events
    // ═══════════════════════════════════════════════════════════════════════

    /// A driver reported a new link
    pub fn on_link_up(&self, transport: TransportKind, address: &str) {
        self.update(|s| {
            // A forced host never becomes someone's client; establish hosts
            if matches!(s.phase, ConnectionPhase::Idle | ConnectionPhase::Discovering)
                && s.role == Role::None
                && s.forced_role != Some(ForcedRole::Host)
            {
                tracing::info!(peer = %address, transport = %transport, "Adopting inbound link as client");
                s.role = Role::Client;
                s.phase = ConnectionPhase::Connected;
                s.transport = Some(transport);
                s.host_address = Some(address.to_string());
            }
        });
    }

    /// A peer completed its handshake
    pub fn on_peer_identified(&self) {
        self.update(|s| {
            s.consecutive_failures = 0;
            s.last_keepalive_ok = Some(now_millis());
            if s.phase == ConnectionPhase::Degraded {
                s.phase = ConnectionPhase::Connected;
            }
        });
    }

    /// A driver reported a link (`Some`) or the session (`None`) went down
    pub async fn on_link_down(&self, transport: TransportKind, address: Option<&str>) {
        let lost_session = {
            let s = self.state.lock();
            if s.transport != Some(transport) {
                false
            } else {
                match address {
                    None => true,
                    Some(addr) => {
                        s.role == Role::Client && s.host_address.as_deref() == Some(addr)
                    }
                }
            }
        };
        if lost_session {
            self.note_failure("session link lost");
            self.teardown("session link lost").await;
        }
    }

    /// A driver reported an error on the active session
    pub async fn on_driver_error(&self, transport: TransportKind, message: &str) {
        if self.state.lock().transport != Some(transport) {
            return;
        }
        tracing::warn!(transport = %transport, message, "Driver error");
        self.record_failure("driver error").await;
    }

    /// Count a session failure; degrade, and tear down at the threshold
    async fn record_failure(&self, reason: &str) {
        let failures = {
            let mut s = self.state.lock();
            if !s.phase.is_connected() {
                return;
            }
            s.consecutive_failures += 1;
            s.consecutive_failures
        };
        tracing::warn!(failures, reason, "Keep-alive failure");
        self.update(|s| s.phase = ConnectionPhase::Degraded);
        if failures >= self.config.failure_threshold {
            self.teardown("failure threshold reached").await;
        }
    }

    /// Drop the session and every link on its medium
    pub async fn teardown(&self, reason: &str) {
        let transport = {
            let mut s = self.state.lock();
            if s.phase == ConnectionPhase::Idle && s.role == Role::None {
                return;
            }
            self.keepalive.lock().clear();
            s.host_address = None;
            s.transport.take()
        };
        tracing::info!(reason, transport = ?transport, "Tearing down session");
        self.update(|s| {
            s.phase = ConnectionPhase::Idle;
            s.role = Role::None;
        });

        if let Some(transport) = transport {
            if let Some(driver) = self.drivers.get(transport).cloned() {
                if let Err(e) = driver.disconnect().await {
                    tracing::warn!(transport = %transport, error = %e, "Disconnect failed");
                }
            }
            for link in self.links.remove_transport(transport) {
                let _ = self.events.send(MeshEvent::PeerDisconnected {
                    device_id: link.device_id,
                });
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Keep-alive
    // ═══════════════════════════════════════════════════════════════════════

    /// One keep-alive round: expire stale pings, enforce the backlog, ping
    pub async fn keepalive_tick(self: &Arc<Self>) {
        let (transport, role, host_address) = {
            let s = self.state.lock();
            if !s.phase.is_connected() {
                return;
            }
            (s.transport, s.role, s.host_address.clone())
        };

        let expired = self.keepalive.lock().expire(Instant::now());
        for seq in expired {
            tracing::debug!(seq, "Ping expired");
            self.record_failure("ping timed out").await;
        }
        if !self.state.lock().phase.is_connected() {
            return;
        }

        let backlog = self.keepalive.lock().pending();
        if backlog >= self.config.ping_backlog_limit {
            tracing::warn!(backlog, "Ping backlog over limit, socket presumed dead");
            self.note_failure("ping backlog");
            self.teardown("ping backlog over limit").await;
            return;
        }

        let Some(transport) = transport else {
            return;
        };
        let (ping_targets, others): (Vec<Link>, Vec<Link>) =
            self.links.all().into_iter().partition(|link| match role {
                Role::Client => host_address
                    .as_deref()
                    .is_some_and(|addr| link.is_at(transport, addr)),
                _ => link.transport == transport,
            });

        let heartbeat = WireMessage::Heartbeat {
            device_id: self.identity.device_id.clone(),
        };
        for link in &others {
            let _ = self.engine.send_frame(link, &heartbeat).await;
        }
        if ping_targets.is_empty() {
            return;
        }

        let seq = self.keepalive.lock().next_ping(Instant::now());
        let ping = WireMessage::Ping {
            seq,
            sent_at_millis: now_millis(),
            device_id: self.identity.device_id.clone(),
        };
        let mut accepted = 0;
        for link in &ping_targets {
            if let Ok(true) = self.engine.send_frame(link, &ping).await {
                accepted += 1;
            }
        }
        if accepted == 0 {
            if self.keepalive.lock().expire_one(seq) {
                self.record_failure("ping not sent").await;
            }
            return;
        }
        self.watch_ping(seq);
    }

    fn watch_ping(self: &Arc<Self>, seq: u64) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let timeout = self.config.ping_timeout();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(manager) = manager.upgrade() {
                        manager.on_ping_timeout(seq).await;
                    }
                }
            }
        });
    }

    /// A ping's deadline passed; counts once per sequence number
    pub async fn on_ping_timeout(&self, seq: u64) {
        let expired = self.keepalive.lock().expire_one(seq);
        if expired {
            self.record_failure("ping timed out").await;
        }
    }

    /// A pong arrived; resets the failure counter when it matches a ping
    pub fn on_pong(&self, seq: u64) -> Option<Duration> {
        let rtt = self.keepalive.lock().on_pong(seq, Instant::now())?;
        tracing::trace!(seq, rtt_ms = rtt.as_millis() as u64, "Pong");
        self.update(|s| {
            s.consecutive_failures = 0;
            s.last_keepalive_ok = Some(now_millis());
            if s.phase == ConnectionPhase::Degraded {
                s.phase = ConnectionPhase::Connected;
            }
        });
        Some(rtt)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Operator controls
    // ═══════════════════════════════════════════════════════════════════════

    /// Pin the role (or release it with `None`); a conflicting session is dropped
    pub async fn force_role(&self, forced: Option<ForcedRole>) {
        let conflicting = {
            let mut s = self.state.lock();
            s.forced_role = forced;
            matches!(
                (forced, s.role),
                (Some(ForcedRole::Host), Role::Client) | (Some(ForcedRole::Client), Role::Host)
            )
        };
        tracing::info!(forced = ?forced, "Role override changed");
        if conflicting {
            self.teardown("forced role conflicts with session").await;
        }
    }

    pub fn set_emergency(&self, emergency: bool) {
        self.state.lock().emergency = emergency;
        tracing::info!(emergency, "Emergency mode changed");
    }

    /// Broadcast a distress beacon on every capable medium, fire-and-forget
    pub fn send_emergency_beacon(&self) {
        let frame = WireMessage::Beacon {
            device_id: self.identity.device_id.clone(),
            device_name: self.identity.display_name.clone(),
            emergency: true,
        };
        let payload = match frame.encode() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode beacon");
                return;
            }
        };
        for transport in self.capabilities.beacon_transports() {
            let Some(driver) = self.drivers.get(transport).cloned() else {
                continue;
            };
            self.engine.note_beacon_sent();
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Err(e) = driver.send_beacon(payload).await {
                    tracing::debug!(transport = %transport, error = %e, "Beacon failed");
                }
            });
        }
    }

    /// Drop the session for good; safe to call repeatedly
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        self.teardown("disposed").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers_follow_failures() {
        assert_eq!(RecoveryTier::from_failures(0), RecoveryTier::Normal);
        assert_eq!(RecoveryTier::from_failures(2), RecoveryTier::Normal);
        assert_eq!(RecoveryTier::from_failures(3), RecoveryTier::Aggressive);
        assert_eq!(RecoveryTier::from_failures(4), RecoveryTier::Aggressive);
        assert_eq!(RecoveryTier::from_failures(5), RecoveryTier::LastResort);
        assert_eq!(RecoveryTier::from_failures(40), RecoveryTier::LastResort);
    }

    #[test]
    fn test_tier_requires_emergency() {
        let mut state = ConnectionState::new(&ConnectionConfig::default());
        state.consecutive_failures = 7;
        state.emergency = false;
        assert_eq!(state.tier(), RecoveryTier::Normal);
        state.emergency = true;
        assert_eq!(state.tier(), RecoveryTier::LastResort);
    }

    #[test]
    fn test_retry_interval_shrinks() {
        let base = Duration::from_secs(30);
        assert_eq!(RecoveryTier::Normal.retry_interval(base), base);
        assert_eq!(
            RecoveryTier::Aggressive.retry_interval(base),
            Duration::from_secs(10)
        );
        assert_eq!(
            RecoveryTier::LastResort.retry_interval(base),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_phase_display_and_serde() {
        assert_eq!(ConnectionPhase::Degraded.to_string(), "degraded");
        assert_eq!(
            serde_json::to_string(&RecoveryTier::LastResort).unwrap(),
            "\"last-resort\""
        );
        assert!(ConnectionPhase::Degraded.is_connected());
        assert!(!ConnectionPhase::Connecting.is_connected());
    }
}
