//! Discovery cycles across every driver
//!
//! A cycle starts scans on all discovery-capable drivers and settles when
//! each of them reports it is finished, or when the hard timeout hits.
//!
//! - Concurrent callers coalesce onto the running cycle instead of starting
//!   another one.
//! - Unforced scans inside the cooldown window are skipped and answered from
//!   the registry.
//! - Rows a cycle did not reconfirm are purged when it settles.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::config::DiscoveryConfig;
use crate::events::MeshEvent;
use crate::peers::{PeerRecord, PeerRegistry};
use crate::transport::{CapabilityDescriptor, DiscoveredPeer, DriverSet};
use crate::types::{now_millis, TransportKind};

/// How a call to [`Discovery::discover`] was served
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryOutcome {
    /// A new cycle ran to completion (or to its timeout)
    Completed {
        peers: Vec<PeerRecord>,
        timed_out: bool,
    },
    /// Joined a cycle another caller had already started
    Coalesced { peers: Vec<PeerRecord> },
    /// Inside the cooldown window; registry contents returned as-is
    CoolingDown { peers: Vec<PeerRecord> },
}

impl DiscoveryOutcome {
    /// Peers known after this call
    pub fn peers(&self) -> &[PeerRecord] {
        match self {
            DiscoveryOutcome::Completed { peers, .. }
            | DiscoveryOutcome::Coalesced { peers }
            | DiscoveryOutcome::CoolingDown { peers } => peers,
        }
    }

    /// Whether the cycle hit its hard timeout
    pub fn timed_out(&self) -> bool {
        matches!(self, DiscoveryOutcome::Completed { timed_out: true, .. })
    }
}

/// Runs discovery cycles and feeds the peer registry
pub struct Discovery {
    drivers: Arc<DriverSet>,
    capabilities: Arc<CapabilityDescriptor>,
    registry: Arc<PeerRegistry>,
    config: DiscoveryConfig,
    events: broadcast::Sender<MeshEvent>,
    running: watch::Sender<bool>,
    settled: watch::Sender<u64>,
    awaiting: Mutex<HashSet<TransportKind>>,
    last_cycle: Mutex<Option<Instant>>,
}

impl Discovery {
    pub fn new(
        drivers: Arc<DriverSet>,
        capabilities: Arc<CapabilityDescriptor>,
        registry: Arc<PeerRegistry>,
        config: DiscoveryConfig,
        events: broadcast::Sender<MeshEvent>,
    ) -> Self {
        let (running, _) = watch::channel(false);
        let (settled, _) = watch::channel(0);
        Self {
            drivers,
            capabilities,
            registry,
            config,
            events,
            running,
            settled,
            awaiting: Mutex::new(HashSet::new()),
            last_cycle: Mutex::new(None),
        }
    }

    /// Whether a cycle is in flight
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Shared registry this discovery feeds
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Run (or join) a discovery cycle
    ///
    /// `force` ignores the cooldown. `parallel` starts every driver at once
    /// instead of one after the other.
    pub async fn discover(&self, force: bool, parallel: bool) -> DiscoveryOutcome {
        if self.is_running() {
            return self.join_running().await;
        }

        if !force {
            let last = *self.last_cycle.lock();
            if let Some(at) = last {
                if at.elapsed() < self.config.cooldown() {
                    tracing::debug!("Discovery inside cooldown, serving registry");
                    return DiscoveryOutcome::CoolingDown {
                        peers: self.registry.available(),
                    };
                }
            }
        }

        // Claim the cycle; losing the race means someone else just started
        let claimed = self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });
        if !claimed {
            return self.join_running().await;
        }

        let outcome = self.run_cycle(parallel).await;
        *self.last_cycle.lock() = Some(Instant::now());
        self.running.send_replace(false);
        outcome
    }

    async fn join_running(&self) -> DiscoveryOutcome {
        let mut rx = self.running.subscribe();
        let wait = async move {
            let _ = rx.wait_for(|running| !*running).await;
        };
        if tokio::time::timeout(self.config.timeout(), wait).await.is_err() {
            tracing::warn!("Timed out waiting for in-flight discovery");
        }
        DiscoveryOutcome::Coalesced {
            peers: self.registry.available(),
        }
    }

    async fn run_cycle(&self, parallel: bool) -> DiscoveryOutcome {
        let cycle_start = now_millis();
        let kinds = self.capabilities.discovery_transports();
        *self.awaiting.lock() = kinds.iter().copied().collect();
        let mut settled = self.settled.subscribe();

        tracing::info!(drivers = kinds.len(), parallel, "Starting discovery cycle");

        let drivers = kinds
            .iter()
            .filter_map(|kind| self.drivers.get(*kind).cloned())
            .collect::<Vec<_>>();
        if parallel {
            let results = join_all(drivers.iter().map(|d| d.start_discovery())).await;
            for (driver, result) in drivers.iter().zip(results) {
                if let Err(e) = result {
                    tracing::warn!(transport = %driver.kind(), error = %e, "Discovery failed to start");
                    self.awaiting.lock().remove(&driver.kind());
                }
            }
        } else {
            for driver in &drivers {
                if let Err(e) = driver.start_discovery().await {
                    tracing::warn!(transport = %driver.kind(), error = %e, "Discovery failed to start");
                    self.awaiting.lock().remove(&driver.kind());
                }
            }
        }

        let wait_all = async {
            loop {
                if self.awaiting.lock().is_empty() {
                    break;
                }
                if settled.changed().await.is_err() {
                    break;
                }
            }
        };
        let timed_out = tokio::time::timeout(self.config.timeout(), wait_all)
            .await
            .is_err();

        for driver in &drivers {
            if let Err(e) = driver.stop_discovery().await {
                tracing::debug!(transport = %driver.kind(), error = %e, "Failed to stop discovery");
            }
        }
        self.awaiting.lock().clear();

        let purged = self.registry.purge_unconfirmed(cycle_start);
        let peers = self.registry.available();
        if timed_out {
            tracing::warn!(found = peers.len(), "Discovery cycle hit its timeout");
        }
        tracing::info!(found = peers.len(), purged, "Discovery cycle settled");
        let _ = self.events.send(MeshEvent::PeersDiscovered(peers.clone()));

        DiscoveryOutcome::Completed { peers, timed_out }
    }

    /// Feed a driver's scan snapshot
    pub fn on_snapshot(&self, transport: TransportKind, peers: Vec<DiscoveredPeer>) {
        self.registry.apply_snapshot(transport, peers);
    }

    /// A driver finished its scan
    pub fn on_finished(&self, transport: TransportKind) {
        self.awaiting.lock().remove(&transport);
        self.settled.send_modify(|n| *n += 1);
    }

    /// A driver lost sight of a peer outside a scan
    pub fn on_peer_lost(&self, transport: TransportKind, address: &str) {
        if self.registry.mark_lost(transport, address).is_some() {
            tracing::debug!(%transport, address, "Peer lost");
        }
    }
}
