//! Opportunistic cloud sync
//!
//! When a device finds internet access it pushes the envelopes it originated
//! and pulls whatever the cloud holds that is newer than its watermark.
//! Pulled envelopes go through the engine's dedup and delivery path but are
//! never relayed back into the mesh.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::envelope::Envelope;
use crate::error::{MeshError, MeshResult};
use crate::events::MeshEvent;
use crate::messaging::MessageEngine;
use crate::storage::EnvelopeStore;
use crate::types::EnvelopeId;

/// Cloud side of the sync, supplied by the embedding application
#[async_trait]
pub trait SyncBridge: Send + Sync + 'static {
    /// Whether the user is signed in
    fn is_authenticated(&self) -> bool;

    async fn has_internet(&self) -> bool;

    /// Upload envelopes; returns the ids the cloud accepted
    async fn push_unsynced_envelopes(&self, envelopes: &[Envelope]) -> MeshResult<Vec<EnvelopeId>>;

    /// Envelopes stored in the cloud after `since_millis`
    async fn pull_envelopes_newer_than(&self, since_millis: i64) -> MeshResult<Vec<Envelope>>;
}

/// Result of one sync round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncReport {
    /// Nothing attempted
    Skipped(&'static str),
    Completed { pushed: usize, pulled: usize },
}

/// Runs sync rounds against a bridge
pub struct SyncDriver {
    bridge: Arc<dyn SyncBridge>,
    store: Arc<dyn EnvelopeStore>,
    engine: Arc<MessageEngine>,
    events: broadcast::Sender<MeshEvent>,
    running: tokio::sync::Mutex<()>,
}

impl SyncDriver {
    pub fn new(
        bridge: Arc<dyn SyncBridge>,
        store: Arc<dyn EnvelopeStore>,
        engine: Arc<MessageEngine>,
        events: broadcast::Sender<MeshEvent>,
    ) -> Self {
        Self {
            bridge,
            store,
            engine,
            events,
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Push local envelopes, then pull newer remote ones
    ///
    /// Unauthenticated or offline devices skip the round without error.
    /// Overlapping calls skip as well.
    pub async fn sync_once(&self) -> MeshResult<SyncReport> {
        let Ok(_round) = self.running.try_lock() else {
            return Ok(SyncReport::Skipped("sync already running"));
        };
        if !self.bridge.is_authenticated() {
            tracing::debug!("Not signed in, skipping sync");
            return Ok(SyncReport::Skipped("not authenticated"));
        }
        if !self.bridge.has_internet().await {
            tracing::debug!("Offline, skipping sync");
            return Ok(SyncReport::Skipped("no internet"));
        }

        let unsynced = self.store.unsynced_envelopes()?;
        let pushed = if unsynced.is_empty() {
            0
        } else {
            let accepted = self
                .bridge
                .push_unsynced_envelopes(&unsynced)
                .await
                .map_err(|e| MeshError::Sync(format!("push failed: {}", e)))?;
            self.store.mark_synced(&accepted)?;
            accepted.len()
        };

        let watermark = self.store.sync_watermark()?;
        let remote = self
            .bridge
            .pull_envelopes_newer_than(watermark)
            .await
            .map_err(|e| MeshError::Sync(format!("pull failed: {}", e)))?;
        let newest = remote
            .iter()
            .map(|e| e.timestamp_millis)
            .max()
            .unwrap_or(watermark);
        let pulled = remote
            .into_iter()
            .filter(|envelope| self.engine.ingest_synced(envelope.clone()))
            .count();
        if newest > watermark {
            self.store.set_sync_watermark(newest)?;
        }

        tracing::info!(pushed, pulled, watermark = newest, "Sync round complete");
        let _ = self.events.send(MeshEvent::SyncCompleted { pushed, pulled });
        Ok(SyncReport::Completed { pushed, pulled })
    }
}
