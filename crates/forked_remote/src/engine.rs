//! Remote engine interface and in-memory implementation.

use crate::changes::{PendingChanges, PendingDatabaseChange, PendingRecordZoneChange};
use crate::error::{RemoteError, RemoteResult};
use crate::event::{
    FailedRecordDelete, FailedRecordSave, FailedZoneSave, FetchedDatabaseChanges,
    FetchedRecordZoneChanges, RecordDeletion, RecordError, RecordErrorCode,
    RecordZoneChangeBatch, SentDatabaseChanges, SentRecordZoneChanges, SyncEvent, ZoneDeletion,
    ZoneDeletionReason,
};
use crate::ids::{RecordId, ZoneId};
use crate::record::RemoteRecord;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Opaque token describing everything the engine has acknowledged so far.
///
/// Delegates persist it byte-for-byte and hand it back on restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSerialization(Vec<u8>);

impl StateSerialization {
    /// Wraps raw bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Engine state captured by a [`StateSerialization`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    /// Server change token the engine has fetched up to.
    pub change_token: u64,
    /// Changes not yet acknowledged by the server.
    pub pending: PendingChanges,
}

impl EngineState {
    /// Encodes the state.
    pub fn serialize(&self) -> RemoteResult<StateSerialization> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| RemoteError::Codec(e.to_string()))?;
        Ok(StateSerialization(bytes))
    }

    /// Decodes a state.
    pub fn deserialize(serialization: &StateSerialization) -> RemoteResult<Self> {
        ciborium::from_reader(serialization.as_bytes())
            .map_err(|e| RemoteError::InvalidStateSerialization(e.to_string()))
    }
}

/// The engine a sync delegate drives.
///
/// Pending-change bookkeeping is local and synchronous; fetching a record
/// goes to the server.
#[async_trait]
pub trait RemoteEngine: Send + Sync + 'static {
    /// Queues record changes.
    fn add_pending_record_zone_changes(&self, changes: &[PendingRecordZoneChange]);

    /// Removes queued record changes.
    fn remove_pending_record_zone_changes(&self, changes: &[PendingRecordZoneChange]);

    /// Returns queued record changes.
    fn pending_record_zone_changes(&self) -> Vec<PendingRecordZoneChange>;

    /// Queues zone changes.
    fn add_pending_database_changes(&self, changes: &[PendingDatabaseChange]);

    /// Removes queued zone changes.
    fn remove_pending_database_changes(&self, changes: &[PendingDatabaseChange]);

    /// Returns queued zone changes.
    fn pending_database_changes(&self) -> Vec<PendingDatabaseChange>;

    /// Serializes the engine's current state.
    fn state_serialization(&self) -> RemoteResult<StateSerialization>;

    /// Fetches the server's copy of a record.
    async fn fetch_record(&self, record_id: &RecordId) -> RemoteResult<Option<RemoteRecord>>;
}

#[derive(Debug, Default)]
struct ServerData {
    zones: BTreeSet<ZoneId>,
    records: BTreeMap<RecordId, RemoteRecord>,
}

/// An in-memory stand-in for the remote service.
///
/// Several engines can share one server to model multiple devices.
#[derive(Debug)]
pub struct MemoryServer {
    data: RwLock<ServerData>,
    next_tag: AtomicU64,
    reachable: AtomicBool,
}

impl MemoryServer {
    /// Creates an empty, reachable server.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(ServerData::default()),
            next_tag: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
        }
    }

    /// Sets whether requests reach the server.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Returns true if requests reach the server.
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Creates a zone.
    pub fn create_zone(&self, zone_id: ZoneId) {
        self.data.write().zones.insert(zone_id);
    }

    /// Returns true if the zone exists.
    pub fn has_zone(&self, zone_id: &ZoneId) -> bool {
        self.data.read().zones.contains(zone_id)
    }

    /// Deletes a zone and all its records.
    pub fn delete_zone(&self, zone_id: &ZoneId) {
        let mut data = self.data.write();
        data.zones.remove(zone_id);
        data.records.retain(|id, _| &id.zone_id != zone_id);
    }

    /// Returns the server's copy of a record.
    pub fn record(&self, record_id: &RecordId) -> Option<RemoteRecord> {
        self.data.read().records.get(record_id).cloned()
    }

    /// Returns the number of stored records.
    pub fn record_count(&self) -> usize {
        self.data.read().records.len()
    }

    /// Stores a record unconditionally, creating its zone, and returns it
    /// with a fresh change tag.
    pub fn force_save(&self, mut record: RemoteRecord) -> RemoteRecord {
        record.change_tag = Some(self.next_change_tag());
        let mut data = self.data.write();
        data.zones.insert(record.record_id.zone_id.clone());
        data.records.insert(record.record_id.clone(), record.clone());
        record
    }

    /// Deletes a record unconditionally. Returns true if it existed.
    pub fn force_delete(&self, record_id: &RecordId) -> bool {
        self.data.write().records.remove(record_id).is_some()
    }

    fn next_change_tag(&self) -> String {
        format!("tag-{}", self.next_tag.fetch_add(1, Ordering::SeqCst))
    }

    fn save(&self, record: &RemoteRecord) -> Result<RemoteRecord, RecordError> {
        let zone_exists = self.has_zone(&record.record_id.zone_id);
        if !zone_exists {
            return Err(RecordError::new(
                RecordErrorCode::ZoneNotFound,
                format!("zone {} does not exist", record.record_id.zone_id),
            ));
        }

        let tag = self.next_change_tag();
        let mut data = self.data.write();
        if let Some(existing) = data.records.get(&record.record_id) {
            if existing.change_tag != record.change_tag {
                return Err(RecordError::server_record_changed(existing.clone()));
            }
        }
        let mut saved = record.clone();
        saved.change_tag = Some(tag);
        data.records.insert(saved.record_id.clone(), saved.clone());
        Ok(saved)
    }

    fn delete(&self, record_id: &RecordId) -> Result<(), RecordError> {
        let mut data = self.data.write();
        if !data.zones.contains(&record_id.zone_id) {
            return Err(RecordError::new(
                RecordErrorCode::ZoneNotFound,
                format!("zone {} does not exist", record_id.zone_id),
            ));
        }
        match data.records.remove(record_id) {
            Some(_) => Ok(()),
            None => Err(RecordError::new(
                RecordErrorCode::UnknownItem,
                format!("record {record_id} does not exist"),
            )),
        }
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-memory remote engine.
///
/// Besides implementing [`RemoteEngine`], it can play the transport's part in
/// tests: [`MemoryRemoteEngine::accept_batch`] sends a batch to the shared
/// [`MemoryServer`] and reports the outcome the way a real engine would, and
/// the `simulate_*` methods produce the events another device's writes cause.
#[derive(Debug)]
pub struct MemoryRemoteEngine {
    state: RwLock<EngineState>,
    server: Arc<MemoryServer>,
}

impl MemoryRemoteEngine {
    /// Creates an engine with its own empty server.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(EngineState::default()),
            server: Arc::new(MemoryServer::new()),
        }
    }

    /// Creates an engine on a shared server, restoring a saved state.
    pub fn with_server(
        server: Arc<MemoryServer>,
        serialization: Option<&StateSerialization>,
    ) -> RemoteResult<Self> {
        let state = match serialization {
            Some(serialization) => EngineState::deserialize(serialization)?,
            None => EngineState::default(),
        };
        Ok(Self {
            state: RwLock::new(state),
            server,
        })
    }

    /// Returns the server.
    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }

    /// Returns a copy of the engine state.
    pub fn engine_state(&self) -> EngineState {
        self.state.read().clone()
    }

    /// Returns a `StateUpdate` event for the current state.
    pub fn state_update(&self) -> RemoteResult<SyncEvent> {
        Ok(SyncEvent::StateUpdate(self.state_serialization()?))
    }

    /// Sends a batch of record changes to the server.
    ///
    /// Successful and permanently failed changes leave the pending queue;
    /// transiently failed ones stay for a later send.
    pub fn accept_batch(&self, batch: &RecordZoneChangeBatch) -> SentRecordZoneChanges {
        let mut sent = SentRecordZoneChanges::default();
        let reachable = self.server.is_reachable();
        let unreachable = || RecordError::new(RecordErrorCode::NetworkUnavailable, "server unreachable");

        for record in &batch.records_to_save {
            let result = if reachable {
                self.server.save(record)
            } else {
                Err(unreachable())
            };
            match result {
                Ok(saved) => sent.saved_records.push(saved),
                Err(error) => sent.failed_record_saves.push(FailedRecordSave {
                    record: record.clone(),
                    error,
                }),
            }
        }

        for record_id in &batch.record_ids_to_delete {
            let result = if reachable {
                self.server.delete(record_id)
            } else {
                Err(unreachable())
            };
            match result {
                Ok(()) => sent.deleted_record_ids.push(record_id.clone()),
                Err(error) => sent.failed_record_deletes.push(FailedRecordDelete {
                    record_id: record_id.clone(),
                    error,
                }),
            }
        }

        let mut done: Vec<PendingRecordZoneChange> = sent
            .saved_records
            .iter()
            .map(|record| PendingRecordZoneChange::SaveRecord(record.record_id.clone()))
            .collect();
        done.extend(
            sent.failed_record_saves
                .iter()
                .filter(|failed| !failed.error.code.is_transient())
                .map(|failed| PendingRecordZoneChange::SaveRecord(failed.record.record_id.clone())),
        );
        done.extend(
            sent.deleted_record_ids
                .iter()
                .cloned()
                .map(PendingRecordZoneChange::DeleteRecord),
        );
        done.extend(
            sent.failed_record_deletes
                .iter()
                .filter(|failed| !failed.error.code.is_transient())
                .map(|failed| PendingRecordZoneChange::DeleteRecord(failed.record_id.clone())),
        );

        let mut state = self.state.write();
        state.pending.remove_record_zone_changes(&done);
        state.change_token += 1;

        debug!(
            saved = sent.saved_records.len(),
            deleted = sent.deleted_record_ids.len(),
            failed = sent.failed_record_saves.len() + sent.failed_record_deletes.len(),
            "accepted record zone change batch"
        );
        sent
    }

    /// Sends every pending zone change to the server.
    pub fn accept_database_changes(&self) -> SentDatabaseChanges {
        let mut sent = SentDatabaseChanges::default();
        let changes = self.pending_database_changes();
        let reachable = self.server.is_reachable();

        let mut done = Vec::new();
        for change in changes {
            if !reachable {
                if let PendingDatabaseChange::SaveZone(zone_id) = change {
                    sent.failed_zone_saves.push(FailedZoneSave {
                        zone_id,
                        error: RecordError::new(RecordErrorCode::NetworkUnavailable, "server unreachable"),
                    });
                }
                continue;
            }
            match &change {
                PendingDatabaseChange::SaveZone(zone_id) => {
                    self.server.create_zone(zone_id.clone());
                    sent.saved_zones.push(zone_id.clone());
                }
                PendingDatabaseChange::DeleteZone(zone_id) => {
                    self.server.delete_zone(zone_id);
                    sent.deleted_zone_ids.push(zone_id.clone());
                }
            }
            done.push(change);
        }

        let mut state = self.state.write();
        state.pending.remove_database_changes(&done);
        state.change_token += 1;
        sent
    }

    /// Another device saves `record`; returns the fetch event this device sees.
    pub fn simulate_remote_save(&self, record: RemoteRecord) -> SyncEvent {
        let saved = self.server.force_save(record);
        self.state.write().change_token += 1;
        SyncEvent::FetchedRecordZoneChanges(FetchedRecordZoneChanges {
            modifications: vec![saved],
            deletions: Vec::new(),
        })
    }

    /// Another device deletes a record; returns the fetch event this device sees.
    pub fn simulate_remote_delete(&self, record_id: RecordId, record_type: impl Into<String>) -> SyncEvent {
        self.server.force_delete(&record_id);
        self.state.write().change_token += 1;
        SyncEvent::FetchedRecordZoneChanges(FetchedRecordZoneChanges {
            modifications: Vec::new(),
            deletions: vec![RecordDeletion {
                record_id,
                record_type: record_type.into(),
            }],
        })
    }

    /// Another device deletes a zone; returns the fetch event this device sees.
    pub fn simulate_zone_deletion(&self, zone_id: ZoneId, reason: ZoneDeletionReason) -> SyncEvent {
        self.server.delete_zone(&zone_id);
        self.state.write().change_token += 1;
        SyncEvent::FetchedDatabaseChanges(FetchedDatabaseChanges {
            modifications: Vec::new(),
            deletions: vec![ZoneDeletion { zone_id, reason }],
        })
    }
}

impl Default for MemoryRemoteEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteEngine for MemoryRemoteEngine {
    fn add_pending_record_zone_changes(&self, changes: &[PendingRecordZoneChange]) {
        self.state.write().pending.add_record_zone_changes(changes);
    }

    fn remove_pending_record_zone_changes(&self, changes: &[PendingRecordZoneChange]) {
        self.state.write().pending.remove_record_zone_changes(changes);
    }

    fn pending_record_zone_changes(&self) -> Vec<PendingRecordZoneChange> {
        self.state.read().pending.record_zone_changes().to_vec()
    }

    fn add_pending_database_changes(&self, changes: &[PendingDatabaseChange]) {
        self.state.write().pending.add_database_changes(changes);
    }

    fn remove_pending_database_changes(&self, changes: &[PendingDatabaseChange]) {
        self.state.write().pending.remove_database_changes(changes);
    }

    fn pending_database_changes(&self) -> Vec<PendingDatabaseChange> {
        self.state.read().pending.database_changes().to_vec()
    }

    fn state_serialization(&self) -> RemoteResult<StateSerialization> {
        self.state.read().serialize()
    }

    async fn fetch_record(&self, record_id: &RecordId) -> RemoteResult<Option<RemoteRecord>> {
        if !self.server.is_reachable() {
            return Err(RemoteError::transport_retryable("server unreachable"));
        }
        Ok(self.server.record(record_id))
    }
}
