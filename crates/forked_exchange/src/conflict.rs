//! Handling of sent batches: save acknowledgements and failure recovery.

use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::Shared;
use crate::forks::{ensure_sync_forks_exist, tear_down_sync_forks, DOWNLOAD_FORK, UPLOAD_FORK};
use crate::inbound::apply_downloaded;
use crate::monitor::stage_upload;
use crate::payload::decode_resource;
use forked_core::{Content, Fork, ForkedResource, MergeExpectation};
use forked_remote::{
    FailedRecordDelete, FailedRecordSave, PendingDatabaseChange, PendingRecordZoneChange,
    RecordErrorCode, RemoteEngine, RemoteRecord, SentRecordZoneChanges,
};
use tracing::{debug, error, info, warn};

/// How a failed record operation is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The server holds a newer version; merge it and retry.
    Conflict,
    /// The zone is gone; recreate it and retry.
    ZoneMissing,
    /// The record is gone on the server.
    UnknownItem,
    /// The engine retries on its own.
    Transient,
    /// Not understood; logged and left alone.
    Unrecognized,
}

impl FailureKind {
    /// Classifies an error code.
    pub fn classify(code: RecordErrorCode) -> Self {
        match code {
            RecordErrorCode::ServerRecordChanged => FailureKind::Conflict,
            RecordErrorCode::ZoneNotFound => FailureKind::ZoneMissing,
            RecordErrorCode::UnknownItem => FailureKind::UnknownItem,
            code if code.is_transient() => FailureKind::Transient,
            _ => FailureKind::Unrecognized,
        }
    }
}

/// Handles the outcome of a sent batch.
pub(crate) fn handle_sent_record_zone_changes<F, E>(shared: &Shared<F, E>, sent: &SentRecordZoneChanges)
where
    F: ForkedResource,
    E: RemoteEngine,
{
    for saved in &sent.saved_records {
        if saved.record_id != shared.record_id {
            continue;
        }
        shared.stats.write().records_saved += 1;
        if let Err(e) = acknowledge_saved(shared, saved) {
            shared.record_failure("acknowledge saved record", &e);
        }
    }

    for failed in &sent.failed_record_saves {
        if failed.record.record_id != shared.record_id {
            continue;
        }
        handle_failed_save(shared, failed);
    }

    for failed in &sent.failed_record_deletes {
        if failed.record_id != shared.record_id {
            continue;
        }
        handle_failed_delete(shared, failed);
    }
}

/// Records that the server now holds `saved`.
///
/// When `main` still equals the saved payload, the download fork is moved to
/// `main`, so the next remote change merges against what the server had
/// rather than against the last download.
///
/// If the upload fork was staged past the saved payload while the batch was
/// in flight, the engine has already dropped the save intent covering it, so
/// it is queued again.
fn acknowledge_saved<F, E>(shared: &Shared<F, E>, saved: &RemoteRecord) -> ExchangeResult<()>
where
    F: ForkedResource,
    E: RemoteEngine,
{
    let resource: F::Resource = decode_resource(saved)?;
    let saved_content = Content::Resource(resource);
    shared.resource.atomically(|txn| {
        if txn.has_fork(&UPLOAD_FORK) {
            if let upload @ Content::Resource(_) = txn.content(&UPLOAD_FORK)? {
                if upload != saved_content {
                    shared
                        .engine
                        .add_pending_record_zone_changes(&[PendingRecordZoneChange::SaveRecord(
                            saved.record_id.clone(),
                        )]);
                    debug!(record = %saved.record_id, "upload fork moved during send, save queued again");
                }
            }
        }
        if !txn.has_fork(&DOWNLOAD_FORK) {
            return Ok(());
        }
        if txn.content(&Fork::MAIN)? == saved_content {
            let outcome = txn.merge_from_main(&DOWNLOAD_FORK, MergeExpectation::Any)?;
            debug!(record = %saved.record_id, %outcome, "download fork caught up with saved record");
        }
        Ok(())
    })
}

fn handle_failed_save<F, E>(shared: &Shared<F, E>, failed: &FailedRecordSave)
where
    F: ForkedResource,
    E: RemoteEngine,
{
    let record_id = &failed.record.record_id;
    match FailureKind::classify(failed.error.code) {
        FailureKind::Conflict => match resolve_conflict(shared, failed) {
            Ok(()) => {
                shared.stats.write().conflicts_resolved += 1;
                info!(record = %record_id, "merged server record after conflict");
            }
            Err(e) => shared.record_failure("resolve conflict", &e),
        },
        FailureKind::ZoneMissing => match recover_missing_zone(shared) {
            Ok(()) => {
                shared.stats.write().zone_recoveries += 1;
                info!(zone = %record_id.zone_id, "zone missing, queued zone and record");
            }
            Err(e) => shared.record_failure("recover missing zone", &e),
        },
        FailureKind::UnknownItem => {
            warn!(record = %record_id, error = %failed.error, "record unknown to server, not retrying");
        }
        FailureKind::Transient => {
            debug!(record = %record_id, error = %failed.error, "transient save failure, left queued");
        }
        FailureKind::Unrecognized => {
            error!(record = %record_id, error = %failed.error, "unrecognized save failure");
        }
    }
}

/// Applies the server's copy through the download fork, then stages the
/// merged `main` and re-queues the save, in one section.
fn resolve_conflict<F, E>(shared: &Shared<F, E>, failed: &FailedRecordSave) -> ExchangeResult<()>
where
    F: ForkedResource,
    E: RemoteEngine,
{
    let Some(server_record) = failed.error.server_record.as_ref() else {
        return Err(ExchangeError::missing_payload(&failed.record.record_id));
    };
    let resource = decode_resource(server_record).map_err(|e| {
        shared.stats.write().decode_failures += 1;
        e
    })?;

    shared.resource.atomically(|txn| {
        apply_downloaded(txn, Content::Resource(resource))?;
        if stage_upload(txn, shared.engine.as_ref(), &shared.record_id)?.is_none() {
            shared
                .engine
                .add_pending_record_zone_changes(&[PendingRecordZoneChange::SaveRecord(
                    shared.record_id.clone(),
                )]);
        }
        Ok(())
    })
}

/// Rebuilds the sync forks and queues the zone ahead of the record.
fn recover_missing_zone<F, E>(shared: &Shared<F, E>) -> ExchangeResult<()>
where
    F: ForkedResource,
    E: RemoteEngine,
{
    shared.resource.atomically(|txn| {
        tear_down_sync_forks(txn)?;
        ensure_sync_forks_exist(txn)?;
        shared
            .engine
            .add_pending_database_changes(&[PendingDatabaseChange::SaveZone(
                shared.config.zone_id.clone(),
            )]);
        shared
            .engine
            .add_pending_record_zone_changes(&[PendingRecordZoneChange::SaveRecord(
                shared.record_id.clone(),
            )]);
        Ok(())
    })
}

fn handle_failed_delete<F, E>(shared: &Shared<F, E>, failed: &FailedRecordDelete)
where
    F: ForkedResource,
    E: RemoteEngine,
{
    match FailureKind::classify(failed.error.code) {
        FailureKind::ZoneMissing | FailureKind::UnknownItem => {
            let change = PendingRecordZoneChange::DeleteRecord(failed.record_id.clone());
            let result = shared.resource.atomically::<_, ExchangeError, _>(|_txn| {
                shared
                    .engine
                    .remove_pending_record_zone_changes(std::slice::from_ref(&change));
                Ok(())
            });
            match result {
                Ok(()) => debug!(record = %failed.record_id, "record already gone, dropped delete"),
                Err(e) => shared.record_failure("drop delete intent", &e),
            }
        }
        FailureKind::Transient => {
            debug!(record = %failed.record_id, error = %failed.error, "transient delete failure, left queued");
        }
        FailureKind::Conflict | FailureKind::Unrecognized => {
            error!(record = %failed.record_id, error = %failed.error, "unrecognized delete failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(
            FailureKind::classify(RecordErrorCode::ServerRecordChanged),
            FailureKind::Conflict
        );
        assert_eq!(
            FailureKind::classify(RecordErrorCode::ZoneNotFound),
            FailureKind::ZoneMissing
        );
        assert_eq!(
            FailureKind::classify(RecordErrorCode::UnknownItem),
            FailureKind::UnknownItem
        );
        for code in [
            RecordErrorCode::NetworkFailure,
            RecordErrorCode::NetworkUnavailable,
            RecordErrorCode::ZoneBusy,
            RecordErrorCode::ServiceUnavailable,
            RecordErrorCode::NotAuthenticated,
            RecordErrorCode::OperationCancelled,
            RecordErrorCode::RequestRateLimited,
        ] {
            assert_eq!(FailureKind::classify(code), FailureKind::Transient, "{code:?}");
        }
        assert_eq!(
            FailureKind::classify(RecordErrorCode::QuotaExceeded),
            FailureKind::Unrecognized
        );
        assert_eq!(
            FailureKind::classify(RecordErrorCode::Other(42)),
            FailureKind::Unrecognized
        );
    }
}
