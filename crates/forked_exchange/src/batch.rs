//! Outbound batch builder.

use crate::error::ExchangeResult;
use crate::exchange::Shared;
use crate::forks::UPLOAD_FORK;
use crate::payload::encode_resource;
use forked_core::{Content, ForkedResource};
use forked_remote::{
    PendingRecordZoneChange, RecordId, RecordZoneChangeBatch, RemoteEngine, RemoteRecord,
    SendChangesContext,
};
use tracing::{debug, warn};

/// Builds the next batch of record changes for the pending intents in scope.
///
/// Returns `None` when there is nothing to send.
pub(crate) async fn next_record_zone_change_batch<F, E>(
    shared: &Shared<F, E>,
    context: &SendChangesContext,
) -> Option<RecordZoneChangeBatch>
where
    F: ForkedResource,
    E: RemoteEngine,
{
    let pending: Vec<PendingRecordZoneChange> = shared
        .engine
        .pending_record_zone_changes()
        .into_iter()
        .filter(|change| context.scope.contains(change))
        .collect();

    let mut batch = RecordZoneChangeBatch::default();
    for change in pending {
        match change {
            PendingRecordZoneChange::DeleteRecord(record_id) => {
                if record_id == shared.record_id {
                    batch.record_ids_to_delete.push(record_id);
                }
            }
            PendingRecordZoneChange::SaveRecord(record_id) => {
                if record_id != shared.record_id {
                    debug!(record = %record_id, "skipping save of foreign record");
                    continue;
                }
                match record_to_save(shared, &record_id).await {
                    Ok(Some(record)) => batch.records_to_save.push(record),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(record = %record_id, error = %e, "failed to prepare record, skipping");
                    }
                }
            }
        }
    }

    if batch.is_empty() {
        return None;
    }
    shared.stats.write().records_batched += batch.len() as u64;
    debug!(
        saves = batch.records_to_save.len(),
        deletes = batch.record_ids_to_delete.len(),
        reason = ?context.reason,
        "built record zone change batch"
    );
    Some(batch)
}

/// Prepares the record for one save intent.
///
/// Drops the intent and returns `None` when the upload fork is empty or the
/// server already holds exactly this payload.
async fn record_to_save<F, E>(shared: &Shared<F, E>, record_id: &RecordId) -> ExchangeResult<Option<RemoteRecord>>
where
    F: ForkedResource,
    E: RemoteEngine,
{
    if shared.resource.content(&UPLOAD_FORK)? == Content::None
        && settle_save_intent(shared, record_id, None)?.is_none()
    {
        return Ok(None);
    }

    let mut record = match shared.engine.fetch_record(record_id).await {
        Ok(Some(record)) => record,
        Ok(None) => RemoteRecord::new(shared.config.record_type.clone(), record_id.clone()),
        Err(e) => {
            debug!(record = %record_id, error = %e, "fetch failed, sending a fresh record");
            RemoteRecord::new(shared.config.record_type.clone(), record_id.clone())
        }
    };

    // The upload fork may have moved while the fetch was in flight
    let Some(data) = settle_save_intent(shared, record_id, record.resource_data())? else {
        return Ok(None);
    };
    record.set_resource_data(data);
    Ok(Some(record))
}

/// Reads the upload fork and decides the save intent in one section.
///
/// Returns the payload to send, or `None` after dropping the intent because
/// the fork is empty or `server_data` already equals its payload.
fn settle_save_intent<F, E>(
    shared: &Shared<F, E>,
    record_id: &RecordId,
    server_data: Option<&[u8]>,
) -> ExchangeResult<Option<Vec<u8>>>
where
    F: ForkedResource,
    E: RemoteEngine,
{
    let change = PendingRecordZoneChange::SaveRecord(record_id.clone());
    shared.resource.atomically(|txn| {
        let data = match txn.content(&UPLOAD_FORK)? {
            Content::Resource(resource) => encode_resource(&resource)?,
            Content::None => {
                shared.engine.remove_pending_record_zone_changes(std::slice::from_ref(&change));
                debug!(record = %record_id, "upload fork is empty, dropped save intent");
                return Ok(None);
            }
        };
        if server_data == Some(data.as_slice()) {
            shared.engine.remove_pending_record_zone_changes(std::slice::from_ref(&change));
            shared.stats.write().unchanged_skipped += 1;
            debug!(record = %record_id, "server already has this payload, dropped save intent");
            return Ok(None);
        }
        Ok(Some(data))
    })
}
