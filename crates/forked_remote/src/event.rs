//! Events delivered by the remote engine, and the batch exchanged on send.

use crate::changes::PendingRecordZoneChange;
use crate::engine::StateSerialization;
use crate::ids::{RecordId, ZoneId};
use crate::record::RemoteRecord;
use std::collections::BTreeSet;
use std::fmt;

/// An event the remote engine delivers to its delegate.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The engine's state changed and should be persisted.
    StateUpdate(StateSerialization),
    /// The signed-in account changed.
    AccountChange(AccountChange),
    /// Zones were modified or deleted remotely.
    FetchedDatabaseChanges(FetchedDatabaseChanges),
    /// Records were modified or deleted remotely.
    FetchedRecordZoneChanges(FetchedRecordZoneChanges),
    /// A batch of zone changes was sent.
    SentDatabaseChanges(SentDatabaseChanges),
    /// A batch of record changes was sent.
    SentRecordZoneChanges(SentRecordZoneChanges),
    /// A fetch is about to start.
    WillFetchChanges,
    /// A fetch for one zone is about to start.
    WillFetchRecordZoneChanges(ZoneId),
    /// A fetch for one zone finished.
    DidFetchRecordZoneChanges {
        /// Zone that was fetched.
        zone_id: ZoneId,
        /// Error that ended the fetch, if any.
        error: Option<RecordError>,
    },
    /// A fetch finished.
    DidFetchChanges,
    /// A send is about to start.
    WillSendChanges(SendChangesContext),
    /// A send finished.
    DidSendChanges(SendChangesContext),
    /// An event kind this client does not understand.
    Unknown(String),
}

impl SyncEvent {
    /// Returns a short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::StateUpdate(_) => "state_update",
            SyncEvent::AccountChange(_) => "account_change",
            SyncEvent::FetchedDatabaseChanges(_) => "fetched_database_changes",
            SyncEvent::FetchedRecordZoneChanges(_) => "fetched_record_zone_changes",
            SyncEvent::SentDatabaseChanges(_) => "sent_database_changes",
            SyncEvent::SentRecordZoneChanges(_) => "sent_record_zone_changes",
            SyncEvent::WillFetchChanges => "will_fetch_changes",
            SyncEvent::WillFetchRecordZoneChanges(_) => "will_fetch_record_zone_changes",
            SyncEvent::DidFetchRecordZoneChanges { .. } => "did_fetch_record_zone_changes",
            SyncEvent::DidFetchChanges => "did_fetch_changes",
            SyncEvent::WillSendChanges(_) => "will_send_changes",
            SyncEvent::DidSendChanges(_) => "did_send_changes",
            SyncEvent::Unknown(_) => "unknown",
        }
    }
}

/// Kind of account change.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AccountChangeType {
    /// An account signed in.
    SignIn,
    /// A different account replaced the signed-in one.
    SwitchAccounts,
    /// The account signed out.
    SignOut,
}

/// An account change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountChange {
    /// What happened.
    pub change_type: AccountChangeType,
}

impl AccountChange {
    /// Creates an account change event.
    pub fn new(change_type: AccountChangeType) -> Self {
        Self { change_type }
    }
}

/// Why a zone was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneDeletionReason {
    /// Deleted by a client.
    Deleted,
    /// Purged by the user; the data is gone everywhere.
    Purged,
    /// The user reset their encrypted data; encrypted fields are gone.
    EncryptedDataReset,
}

/// A remote zone deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneDeletion {
    /// Deleted zone.
    pub zone_id: ZoneId,
    /// Why it was deleted.
    pub reason: ZoneDeletionReason,
}

/// Zone-level changes fetched from the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedDatabaseChanges {
    /// Zones created or modified.
    pub modifications: Vec<ZoneId>,
    /// Zones deleted.
    pub deletions: Vec<ZoneDeletion>,
}

/// A remote record deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDeletion {
    /// Deleted record.
    pub record_id: RecordId,
    /// Type of the deleted record.
    pub record_type: String,
}

/// Record-level changes fetched from the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedRecordZoneChanges {
    /// Records created or modified.
    pub modifications: Vec<RemoteRecord>,
    /// Records deleted.
    pub deletions: Vec<RecordDeletion>,
}

/// Error code reported for a single record or zone operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RecordErrorCode {
    /// The server holds a newer version of the record.
    ServerRecordChanged,
    /// The record's zone does not exist.
    ZoneNotFound,
    /// The record does not exist on the server.
    UnknownItem,
    /// The request did not reach the server.
    NetworkFailure,
    /// No network is available.
    NetworkUnavailable,
    /// The zone is handling too many requests.
    ZoneBusy,
    /// The service is temporarily unavailable.
    ServiceUnavailable,
    /// No account is signed in.
    NotAuthenticated,
    /// The operation was cancelled.
    OperationCancelled,
    /// The client is sending too many requests.
    RequestRateLimited,
    /// The account's storage quota is exhausted.
    QuotaExceeded,
    /// The request was malformed or rejected permanently.
    InvalidArguments,
    /// The server reported an internal error.
    InternalError,
    /// The account lacks permission.
    PermissionFailure,
    /// A code this client does not know.
    Other(i32),
}

impl RecordErrorCode {
    /// Returns true for failures the engine retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecordErrorCode::NetworkFailure
                | RecordErrorCode::NetworkUnavailable
                | RecordErrorCode::ZoneBusy
                | RecordErrorCode::ServiceUnavailable
                | RecordErrorCode::NotAuthenticated
                | RecordErrorCode::OperationCancelled
                | RecordErrorCode::RequestRateLimited
        )
    }
}

/// Error reported for a single record or zone operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordError {
    /// Error code.
    pub code: RecordErrorCode,
    /// The server's copy of the record, for `ServerRecordChanged`.
    pub server_record: Option<RemoteRecord>,
    /// Human-readable description.
    pub message: String,
}

impl RecordError {
    /// Creates an error with no server record attached.
    pub fn new(code: RecordErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            server_record: None,
            message: message.into(),
        }
    }

    /// Creates a `ServerRecordChanged` error carrying the server's record.
    pub fn server_record_changed(server_record: RemoteRecord) -> Self {
        Self {
            code: RecordErrorCode::ServerRecordChanged,
            server_record: Some(server_record),
            message: "server record changed".into(),
        }
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// A record save that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecordSave {
    /// The record that was sent.
    pub record: RemoteRecord,
    /// Why it failed.
    pub error: RecordError,
}

/// A record delete that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecordDelete {
    /// The record that was to be deleted.
    pub record_id: RecordId,
    /// Why it failed.
    pub error: RecordError,
}

/// Outcome of sending a batch of record changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentRecordZoneChanges {
    /// Records saved, with their new change tags.
    pub saved_records: Vec<RemoteRecord>,
    /// Record saves that failed.
    pub failed_record_saves: Vec<FailedRecordSave>,
    /// Records deleted.
    pub deleted_record_ids: Vec<RecordId>,
    /// Record deletes that failed.
    pub failed_record_deletes: Vec<FailedRecordDelete>,
}

/// A zone save that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedZoneSave {
    /// Zone that was to be created.
    pub zone_id: ZoneId,
    /// Why it failed.
    pub error: RecordError,
}

/// Outcome of sending a batch of zone changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentDatabaseChanges {
    /// Zones created.
    pub saved_zones: Vec<ZoneId>,
    /// Zone saves that failed.
    pub failed_zone_saves: Vec<FailedZoneSave>,
    /// Zones deleted.
    pub deleted_zone_ids: Vec<ZoneId>,
}

/// Why the engine is sending changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    /// Automatic, engine-scheduled send.
    Scheduled,
    /// Explicitly requested send.
    Manual,
}

/// Which pending changes a send covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendScope {
    /// Every pending change.
    All,
    /// Only changes in these zones.
    Zones(BTreeSet<ZoneId>),
    /// Every change except those in these zones.
    ExcludingZones(BTreeSet<ZoneId>),
    /// Only changes to these records.
    Records(BTreeSet<RecordId>),
}

impl SendScope {
    /// Returns true if `record_id` is in scope.
    pub fn contains_record(&self, record_id: &RecordId) -> bool {
        match self {
            SendScope::All => true,
            SendScope::Zones(zones) => zones.contains(&record_id.zone_id),
            SendScope::ExcludingZones(zones) => !zones.contains(&record_id.zone_id),
            SendScope::Records(records) => records.contains(record_id),
        }
    }

    /// Returns true if `change` is in scope.
    pub fn contains(&self, change: &PendingRecordZoneChange) -> bool {
        self.contains_record(change.record_id())
    }
}

/// Context passed when the engine asks for the next batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendChangesContext {
    /// Why the send happens.
    pub reason: SyncReason,
    /// Which changes it covers.
    pub scope: SendScope,
}

impl SendChangesContext {
    /// Creates a scheduled send covering every change.
    pub fn scheduled() -> Self {
        Self {
            reason: SyncReason::Scheduled,
            scope: SendScope::All,
        }
    }

    /// Creates a manual send with the given scope.
    pub fn manual(scope: SendScope) -> Self {
        Self {
            reason: SyncReason::Manual,
            scope,
        }
    }
}

/// A batch of record changes to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordZoneChangeBatch {
    /// Records to save.
    pub records_to_save: Vec<RemoteRecord>,
    /// Records to delete.
    pub record_ids_to_delete: Vec<RecordId>,
}

impl RecordZoneChangeBatch {
    /// Returns true if the batch contains nothing.
    pub fn is_empty(&self) -> bool {
        self.records_to_save.is_empty() && self.record_ids_to_delete.is_empty()
    }

    /// Returns the number of changes.
    pub fn len(&self) -> usize {
        self.records_to_save.len() + self.record_ids_to_delete.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(zone: &str, name: &str) -> RecordId {
        RecordId::new(name, ZoneId::new(zone))
    }

    #[test]
    fn scope_filters_records() {
        let id = record("a", "doc");
        assert!(SendScope::All.contains_record(&id));

        let zones: BTreeSet<_> = [ZoneId::new("a")].into_iter().collect();
        assert!(SendScope::Zones(zones.clone()).contains_record(&id));
        assert!(!SendScope::ExcludingZones(zones).contains_record(&id));

        let records: BTreeSet<_> = [record("a", "other")].into_iter().collect();
        assert!(!SendScope::Records(records).contains(&PendingRecordZoneChange::SaveRecord(id)));
    }

    #[test]
    fn transient_codes() {
        assert!(RecordErrorCode::NetworkFailure.is_transient());
        assert!(RecordErrorCode::OperationCancelled.is_transient());
        assert!(!RecordErrorCode::ServerRecordChanged.is_transient());
        assert!(!RecordErrorCode::Other(42).is_transient());
    }

    #[test]
    fn batch_len() {
        let mut batch = RecordZoneChangeBatch::default();
        assert!(batch.is_empty());
        batch.record_ids_to_delete.push(record("a", "doc"));
        assert_eq!(batch.len(), 1);
    }
}
