//! Envelope persistence
//!
//! The engine writes every envelope it originates or accepts through an
//! [`EnvelopeStore`] before acting on it, so queued traffic and message
//! history survive a restart. Two implementations ship:
//!
//! - [`MemoryStore`]: process-local, used in tests and simulations
//! - [`RedbStore`]: ACID storage in a single redb file
//!
//! Records are stored as JSON so the on-disk format stays readable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::MeshResult;
use crate::types::{now_millis, DeviceId, EnvelopeId, TransportKind};

/// Whether an envelope was minted here or arrived from the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeOrigin {
    Local,
    Remote,
}

/// An envelope plus its local bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEnvelope {
    pub envelope: Envelope,
    pub origin: EnvelopeOrigin,
    /// Handed to at least one link, or confirmed by the target
    pub delivered: bool,
    /// Pushed to the cloud backend
    pub synced: bool,
    /// First time this device stored it (Unix millis)
    pub stored_at: i64,
}

/// Connection details for a host we successfully joined before
///
/// Arbitration prefers reconnecting to a known host over rolling the dice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownPeerCredentials {
    pub transport: TransportKind,
    pub address: String,
    /// Device id behind the address, once a handshake revealed it
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    pub display_name: String,
    /// Last successful connect (Unix millis)
    pub saved_at: i64,
}

impl KnownPeerCredentials {
    fn key(&self) -> String {
        format!("{}|{}", self.transport, self.address)
    }
}

/// Persistence seam for envelopes and host credentials
pub trait EnvelopeStore: Send + Sync {
    /// Insert or refresh an envelope; existing delivery and sync flags survive
    fn save_envelope(&self, envelope: &Envelope, origin: EnvelopeOrigin) -> MeshResult<()>;

    /// Look up one envelope
    fn get_envelope(&self, id: &EnvelopeId) -> MeshResult<Option<StoredEnvelope>>;

    /// Locally originated envelopes not yet handed to any link
    fn get_pending_envelopes(&self) -> MeshResult<Vec<Envelope>>;

    /// Flag an envelope as handed off or confirmed
    fn mark_delivered(&self, id: &EnvelopeId) -> MeshResult<()>;

    /// Locally originated envelopes not yet pushed to the cloud
    fn unsynced_envelopes(&self) -> MeshResult<Vec<Envelope>>;

    /// Flag envelopes as pushed to the cloud
    fn mark_synced(&self, ids: &[EnvelopeId]) -> MeshResult<()>;

    /// Newest cloud timestamp already pulled (Unix millis)
    fn sync_watermark(&self) -> MeshResult<i64>;

    fn set_sync_watermark(&self, millis: i64) -> MeshResult<()>;

    /// Remember a host we joined
    fn save_known_peer_credentials(&self, credentials: &KnownPeerCredentials) -> MeshResult<()>;

    fn get_known_peer_credentials(&self) -> MeshResult<Vec<KnownPeerCredentials>>;
}

fn merge(existing: Option<StoredEnvelope>, envelope: &Envelope, origin: EnvelopeOrigin) -> StoredEnvelope {
    match existing {
        Some(mut stored) => {
            stored.envelope = envelope.clone();
            stored
        }
        None => StoredEnvelope {
            envelope: envelope.clone(),
            origin,
            delivered: false,
            synced: origin == EnvelopeOrigin::Remote,
            stored_at: now_millis(),
        },
    }
}

fn sorted_envelopes(mut records: Vec<StoredEnvelope>) -> Vec<Envelope> {
    records.sort_by(|a, b| {
        a.envelope
            .timestamp_millis
            .cmp(&b.envelope.timestamp_millis)
            .then_with(|| a.envelope.id.cmp(&b.envelope.id))
    });
    records.into_iter().map(|r| r.envelope).collect()
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MemoryState {
    envelopes: HashMap<EnvelopeId, StoredEnvelope>,
    credentials: HashMap<String, KnownPeerCredentials>,
    watermark: i64,
}

/// Process-local store
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored envelopes
    pub fn len(&self) -> usize {
        self.state.read().envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().envelopes.is_empty()
    }
}

impl EnvelopeStore for MemoryStore {
    fn save_envelope(&self, envelope: &Envelope, origin: EnvelopeOrigin) -> MeshResult<()> {
        let mut state = self.state.write();
        let existing = state.envelopes.remove(&envelope.id);
        let record = merge(existing, envelope, origin);
        state.envelopes.insert(envelope.id.clone(), record);
        Ok(())
    }

    fn get_envelope(&self, id: &EnvelopeId) -> MeshResult<Option<StoredEnvelope>> {
        Ok(self.state.read().envelopes.get(id).cloned())
    }

    fn get_pending_envelopes(&self) -> MeshResult<Vec<Envelope>> {
        let records = self
            .state
            .read()
            .envelopes
            .values()
            .filter(|r| r.origin == EnvelopeOrigin::Local && !r.delivered)
            .cloned()
            .collect();
        Ok(sorted_envelopes(records))
    }

    fn mark_delivered(&self, id: &EnvelopeId) -> MeshResult<()> {
        if let Some(record) = self.state.write().envelopes.get_mut(id) {
            record.delivered = true;
        }
        Ok(())
    }

    fn unsynced_envelopes(&self) -> MeshResult<Vec<Envelope>> {
        let records = self
            .state
            .read()
            .envelopes
            .values()
            .filter(|r| r.origin == EnvelopeOrigin::Local && !r.synced)
            .cloned()
            .collect();
        Ok(sorted_envelopes(records))
    }

    fn mark_synced(&self, ids: &[EnvelopeId]) -> MeshResult<()> {
        let mut state = self.state.write();
        for id in ids {
            if let Some(record) = state.envelopes.get_mut(id) {
                record.synced = true;
            }
        }
        Ok(())
    }

    fn sync_watermark(&self) -> MeshResult<i64> {
        Ok(self.state.read().watermark)
    }

    fn set_sync_watermark(&self, millis: i64) -> MeshResult<()> {
        self.state.write().watermark = millis;
        Ok(())
    }

    fn save_known_peer_credentials(&self, credentials: &KnownPeerCredentials) -> MeshResult<()> {
        self.state
            .write()
            .credentials
            .insert(credentials.key(), credentials.clone());
        Ok(())
    }

    fn get_known_peer_credentials(&self) -> MeshResult<Vec<KnownPeerCredentials>> {
        let mut list = self
            .state
            .read()
            .credentials
            .values()
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(list)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// redb store
// ═══════════════════════════════════════════════════════════════════════

const ENVELOPES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("envelopes");
const CREDENTIALS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("peer_credentials");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const WATERMARK_KEY: &str = "sync_watermark";

/// Persistent store backed by a redb file
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<RwLock<Database>>,
}

impl RedbStore {
    /// Open or create the database at `path`, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ENVELOPES_TABLE)?;
            let _ = write_txn.open_table(CREDENTIALS_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        tracing::debug!(path = %path.display(), "Opened envelope store");
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    fn scan_envelopes(
        &self,
        keep: impl Fn(&StoredEnvelope) -> bool,
    ) -> MeshResult<Vec<StoredEnvelope>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ENVELOPES_TABLE)?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: StoredEnvelope = serde_json::from_slice(value.value())?;
            if keep(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn update_envelopes(
        &self,
        ids: &[EnvelopeId],
        apply: impl Fn(&mut StoredEnvelope),
    ) -> MeshResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENVELOPES_TABLE)?;
            for id in ids {
                let existing = table.get(id.as_str())?.map(|v| v.value().to_vec());
                if let Some(bytes) = existing {
                    let mut record: StoredEnvelope = serde_json::from_slice(&bytes)?;
                    apply(&mut record);
                    let data = serde_json::to_vec(&record)?;
                    table.insert(id.as_str(), data.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl EnvelopeStore for RedbStore {
    fn save_envelope(&self, envelope: &Envelope, origin: EnvelopeOrigin) -> MeshResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENVELOPES_TABLE)?;
            let key = envelope.id.as_str();
            let existing = match table.get(key)?.map(|v| v.value().to_vec()) {
                Some(bytes) => Some(serde_json::from_slice::<StoredEnvelope>(&bytes)?),
                None => None,
            };
            let record = merge(existing, envelope, origin);
            let data = serde_json::to_vec(&record)?;
            table.insert(key, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_envelope(&self, id: &EnvelopeId) -> MeshResult<Option<StoredEnvelope>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ENVELOPES_TABLE)?;
        match table.get(id.as_str())? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    fn get_pending_envelopes(&self) -> MeshResult<Vec<Envelope>> {
        let records =
            self.scan_envelopes(|r| r.origin == EnvelopeOrigin::Local && !r.delivered)?;
        Ok(sorted_envelopes(records))
    }

    fn mark_delivered(&self, id: &EnvelopeId) -> MeshResult<()> {
        self.update_envelopes(std::slice::from_ref(id), |r| r.delivered = true)
    }

    fn unsynced_envelopes(&self) -> MeshResult<Vec<Envelope>> {
        let records = self.scan_envelopes(|r| r.origin == EnvelopeOrigin::Local && !r.synced)?;
        Ok(sorted_envelopes(records))
    }

    fn mark_synced(&self, ids: &[EnvelopeId]) -> MeshResult<()> {
        self.update_envelopes(ids, |r| r.synced = true)
    }

    fn sync_watermark(&self) -> MeshResult<i64> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        match table.get(WATERMARK_KEY)? {
            Some(v) => Ok(serde_json::from_slice(v.value())?),
            None => Ok(0),
        }
    }

    fn set_sync_watermark(&self, millis: i64) -> MeshResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            let data = serde_json::to_vec(&millis)?;
            table.insert(WATERMARK_KEY, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn save_known_peer_credentials(&self, credentials: &KnownPeerCredentials) -> MeshResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CREDENTIALS_TABLE)?;
            let data = serde_json::to_vec(credentials)?;
            table.insert(credentials.key().as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_known_peer_credentials(&self) -> MeshResult<Vec<KnownPeerCredentials>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CREDENTIALS_TABLE)?;

        let mut list = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            list.push(serde_json::from_slice::<KnownPeerCredentials>(value.value())?);
        }
        list.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LocalIdentity, MessageKind};
    use tempfile::tempdir;

    fn envelope(body: &str, timestamp: i64) -> Envelope {
        let mut env = Envelope::new(
            &LocalIdentity::new("me", "Me"),
            body,
            MessageKind::Text,
            Some(DeviceId::new("c")),
            5,
        );
        env.timestamp_millis = timestamp;
        env
    }

    fn exercise(store: &dyn EnvelopeStore) {
        let first = envelope("first", 10);
        let second = envelope("second", 20);
        let mut inbound = envelope("inbound", 5);
        inbound.sender_id = DeviceId::new("other");

        store.save_envelope(&second, EnvelopeOrigin::Local).unwrap();
        store.save_envelope(&first, EnvelopeOrigin::Local).unwrap();
        store.save_envelope(&inbound, EnvelopeOrigin::Remote).unwrap();

        let pending = store.get_pending_envelopes().unwrap();
        assert_eq!(
            pending.iter().map(|e| e.body.as_str()).collect::<Vec<_>>(),
            vec!["first", "second"]
        );

        store.mark_delivered(&first.id).unwrap();
        // Re-saving keeps the delivered flag
        store.save_envelope(&first, EnvelopeOrigin::Local).unwrap();
        assert_eq!(store.get_pending_envelopes().unwrap(), vec![second.clone()]);
        assert!(store.get_envelope(&first.id).unwrap().unwrap().delivered);

        assert_eq!(store.unsynced_envelopes().unwrap().len(), 2);
        store.mark_synced(&[first.id.clone(), second.id.clone()]).unwrap();
        assert!(store.unsynced_envelopes().unwrap().is_empty());

        assert_eq!(store.sync_watermark().unwrap(), 0);
        store.set_sync_watermark(1234).unwrap();
        assert_eq!(store.sync_watermark().unwrap(), 1234);

        let creds = KnownPeerCredentials {
            transport: TransportKind::Hotspot,
            address: "10.0.0.1".into(),
            device_id: None,
            display_name: "Base".into(),
            saved_at: 99,
        };
        store.save_known_peer_credentials(&creds).unwrap();
        store.save_known_peer_credentials(&creds).unwrap();
        assert_eq!(store.get_known_peer_credentials().unwrap(), vec![creds]);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        exercise(&store);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_redb_store() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("mesh.redb")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_redb_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("mesh.redb");
        let env = envelope("persisted", 1);
        {
            let store = RedbStore::open(&path).unwrap();
            store.save_envelope(&env, EnvelopeOrigin::Local).unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get_pending_envelopes().unwrap(), vec![env]);
    }
}
