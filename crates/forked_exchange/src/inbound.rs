//! Inbound change handling.
//!
//! Remote content always enters through the download fork and reaches `main`
//! by merge, so local edits made meanwhile are combined rather than
//! overwritten.

use crate::conflict::handle_sent_record_zone_changes;
use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::Shared;
use crate::forks::{ensure_sync_forks_exist, tear_down_sync_forks, DOWNLOAD_FORK};
use crate::payload::decode_resource;
use crate::state_file::PersistedSyncState;
use forked_core::{Content, CoreResult, Fork, ForkTransaction, ForkedResource, MergeExpectation, MergeOutcome};
use forked_remote::{
    AccountChange, AccountChangeType, FetchedDatabaseChanges, FetchedRecordZoneChanges,
    PendingDatabaseChange, PendingRecordZoneChange, RemoteEngine, RemoteRecord,
    SentDatabaseChanges, StateSerialization, SyncEvent, ZoneDeletionReason,
};
use tracing::{debug, error, info, warn};

/// Writes remote content into the download fork and merges it into `main`.
pub fn apply_downloaded<R>(txn: &mut dyn ForkTransaction<R>, content: Content<R>) -> CoreResult<MergeOutcome> {
    txn.update(&DOWNLOAD_FORK, content)?;
    txn.merge_into_main(&DOWNLOAD_FORK, MergeExpectation::Any)
}

/// Dispatches one engine event.
pub(crate) fn handle_event<F, E>(shared: &Shared<F, E>, event: SyncEvent)
where
    F: ForkedResource,
    E: RemoteEngine,
{
    let kind = event.kind();
    let result = match event {
        SyncEvent::StateUpdate(serialization) => persist_state(shared, serialization),
        SyncEvent::AccountChange(change) => handle_account_change(shared, &change),
        SyncEvent::FetchedDatabaseChanges(changes) => {
            handle_database_changes(shared, &changes);
            Ok(())
        }
        SyncEvent::FetchedRecordZoneChanges(changes) => {
            handle_record_zone_changes(shared, &changes);
            Ok(())
        }
        SyncEvent::SentRecordZoneChanges(sent) => {
            handle_sent_record_zone_changes(shared, &sent);
            Ok(())
        }
        SyncEvent::SentDatabaseChanges(sent) => {
            handle_sent_database_changes(shared, &sent);
            Ok(())
        }
        SyncEvent::WillFetchChanges
        | SyncEvent::WillFetchRecordZoneChanges(_)
        | SyncEvent::DidFetchRecordZoneChanges { .. }
        | SyncEvent::DidFetchChanges
        | SyncEvent::WillSendChanges(_)
        | SyncEvent::DidSendChanges(_) => {
            debug!(event = kind, "no action for event");
            Ok(())
        }
        SyncEvent::Unknown(name) => {
            error!(event = %name, "unknown sync event");
            Ok(())
        }
    };

    if let Err(e) = result {
        shared.record_failure(kind, &e);
    }
}

/// Flushes the resource, then persists the engine state, in one section.
fn persist_state<F, E>(shared: &Shared<F, E>, serialization: StateSerialization) -> ExchangeResult<()>
where
    F: ForkedResource,
    E: RemoteEngine,
{
    let state = PersistedSyncState::new(serialization);
    shared.resource.atomically(|txn| {
        txn.flush()?;
        shared.state_store.save(&state)?;
        Ok(())
    })
}

fn handle_account_change<F, E>(shared: &Shared<F, E>, change: &AccountChange) -> ExchangeResult<()>
where
    F: ForkedResource,
    E: RemoteEngine,
{
    match change.change_type {
        AccountChangeType::SignIn | AccountChangeType::SwitchAccounts => {
            info!(change = ?change.change_type, "account changed, resetting sync forks");
            shared
                .resource
                .atomically(|txn| reset_and_requeue(shared, txn, false))
        }
        AccountChangeType::SignOut => {
            info!("account signed out, removing sync forks");
            shared.resource.atomically(|txn| Ok(tear_down_sync_forks(txn)?))
        }
        _ => {
            warn!(change = ?change.change_type, "unhandled account change");
            Ok(())
        }
    }
}

fn handle_database_changes<F, E>(shared: &Shared<F, E>, changes: &FetchedDatabaseChanges)
where
    F: ForkedResource,
    E: RemoteEngine,
{
    for deletion in &changes.deletions {
        if deletion.zone_id != shared.config.zone_id {
            info!(zone = %deletion.zone_id, "ignoring deletion of foreign zone");
            continue;
        }

        match deletion.reason {
            ZoneDeletionReason::Deleted => {
                info!(zone = %deletion.zone_id, "zone deleted remotely, removing sync forks");
                let result = shared
                    .resource
                    .atomically::<_, ExchangeError, _>(|txn| Ok(tear_down_sync_forks(txn)?));
                if let Err(e) = result {
                    shared.record_failure("remove sync forks after zone deletion", &e);
                }
            }
            ZoneDeletionReason::Purged | ZoneDeletionReason::EncryptedDataReset => {
                info!(
                    zone = %deletion.zone_id,
                    reason = ?deletion.reason,
                    "zone reset remotely, re-uploading local content"
                );
                match shared
                    .resource
                    .atomically(|txn| reset_and_requeue(shared, txn, true))
                {
                    Ok(()) => shared.stats.write().zone_recoveries += 1,
                    Err(e) => shared.record_failure("re-upload after zone reset", &e),
                }
            }
        }
    }
}

fn handle_sent_database_changes<F, E>(shared: &Shared<F, E>, sent: &SentDatabaseChanges)
where
    F: ForkedResource,
    E: RemoteEngine,
{
    for zone_id in &sent.saved_zones {
        if *zone_id == shared.config.zone_id {
            debug!(zone = %zone_id, "zone saved");
        }
    }
    // The engine keeps failed zone saves queued and retries them
    for failed in &sent.failed_zone_saves {
        if failed.zone_id != shared.config.zone_id {
            continue;
        }
        if failed.error.code.is_transient() {
            debug!(zone = %failed.zone_id, error = %failed.error, "transient zone save failure");
        } else {
            warn!(zone = %failed.zone_id, error = %failed.error, "zone save failed");
        }
    }
}

/// Rebuilds the sync forks and queues the local content for upload.
///
/// With `save_zone`, the zone is queued ahead of the record.
fn reset_and_requeue<F, E>(
    shared: &Shared<F, E>,
    txn: &mut dyn ForkTransaction<F::Resource>,
    save_zone: bool,
) -> ExchangeResult<()>
where
    F: ForkedResource,
    E: RemoteEngine,
{
    tear_down_sync_forks(txn)?;
    ensure_sync_forks_exist(txn)?;
    if save_zone {
        shared
            .engine
            .add_pending_database_changes(&[PendingDatabaseChange::SaveZone(shared.config.zone_id.clone())]);
    }
    if let Content::Resource(_) = txn.content(&Fork::MAIN)? {
        shared
            .engine
            .add_pending_record_zone_changes(&[PendingRecordZoneChange::SaveRecord(shared.record_id.clone())]);
    }
    Ok(())
}

fn handle_record_zone_changes<F, E>(shared: &Shared<F, E>, changes: &FetchedRecordZoneChanges)
where
    F: ForkedResource,
    E: RemoteEngine,
{
    for record in &changes.modifications {
        if record.record_id != shared.record_id {
            continue;
        }
        match apply_remote_record(shared, record) {
            Ok(outcome) => {
                shared.stats.write().records_downloaded += 1;
                debug!(record = %record.record_id, %outcome, "applied remote modification");
            }
            Err(e) => shared.record_failure("apply remote modification", &e),
        }
    }

    for deletion in &changes.deletions {
        if deletion.record_id != shared.record_id {
            continue;
        }
        match shared
            .resource
            .atomically(|txn| apply_downloaded(txn, Content::None))
        {
            Ok(outcome) => {
                shared.stats.write().remote_deletions += 1;
                debug!(record = %deletion.record_id, %outcome, "applied remote deletion");
            }
            Err(e) => shared.record_failure("apply remote deletion", &ExchangeError::from(e)),
        }
    }
}

/// Decodes a remote record and applies it through the download fork.
///
/// Undecodable payloads are counted and dropped, never retried.
fn apply_remote_record<F, E>(shared: &Shared<F, E>, record: &RemoteRecord) -> ExchangeResult<MergeOutcome>
where
    F: ForkedResource,
    E: RemoteEngine,
{
    let resource = decode_resource(record).map_err(|e| {
        shared.stats.write().decode_failures += 1;
        e
    })?;
    shared
        .resource
        .atomically(|txn| Ok(apply_downloaded(txn, Content::Resource(resource))?))
}
