//! Outbound change monitor.
//!
//! Watches the resource's change feed and stages `main` for upload whenever
//! a local edit lands on it. Merges that bring remote content into `main`
//! (or fold sync forks back during teardown) are not local edits and do not
//! trigger an upload, which keeps downloads from echoing back to the server.

use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::Shared;
use crate::forks::{is_sync_fork, DOWNLOAD_FORK, UPLOAD_FORK};
use forked_core::{ChangeEvent, ChangeStream, Content, ForkTransaction, ForkedResource, MergeExpectation};
use forked_remote::{PendingRecordZoneChange, RecordId, RemoteEngine};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Returns true if `event` is a local edit of `main`.
pub fn triggers_upload(event: &ChangeEvent) -> bool {
    event.fork.is_main() && !event.merging_fork.as_ref().is_some_and(is_sync_fork)
}

/// Advances the upload fork to `main` and queues the matching intent.
///
/// Does nothing if the upload fork is missing or already has everything in
/// `main`. The upload fork only ever moves by merging from `main`, so the
/// merge must be a fast-forward.
pub fn stage_upload<R, E>(
    txn: &mut dyn ForkTransaction<R>,
    engine: &E,
    record_id: &RecordId,
) -> ExchangeResult<Option<PendingRecordZoneChange>>
where
    E: RemoteEngine + ?Sized,
{
    if !txn.has_fork(&UPLOAD_FORK) || !txn.has_unmerged_commits_in_main(&UPLOAD_FORK)? {
        return Ok(None);
    }

    txn.merge_from_main(&UPLOAD_FORK, MergeExpectation::FastForward)?;
    let change = match txn.content(&UPLOAD_FORK)? {
        Content::None => PendingRecordZoneChange::DeleteRecord(record_id.clone()),
        Content::Resource(_) => PendingRecordZoneChange::SaveRecord(record_id.clone()),
    };
    engine.add_pending_record_zone_changes(std::slice::from_ref(&change));
    Ok(Some(change))
}

/// Runs one evaluation in its own atomic section.
pub(crate) fn upload_main_if_needed<F, E>(shared: &Shared<F, E>) -> ExchangeResult<Option<PendingRecordZoneChange>>
where
    F: ForkedResource,
    E: RemoteEngine,
{
    let change = shared
        .resource
        .atomically(|txn| stage_upload(txn, shared.engine.as_ref(), &shared.record_id))?;

    if let Some(change) = &change {
        let mut stats = shared.stats.write();
        match change {
            PendingRecordZoneChange::SaveRecord(_) => stats.saves_queued += 1,
            PendingRecordZoneChange::DeleteRecord(_) => stats.deletes_queued += 1,
        }
        debug!(record = %change.record_id(), ?change, "queued local change for upload");
    }
    Ok(change)
}

/// Queues a save when the upload fork holds content the server has not
/// acknowledged and no intent covers the record.
///
/// The download fork tracks what the server last held. An upload fork that
/// differs from it with nothing pending means a save intent was lost, as
/// when the process stops after the resource is flushed but before the
/// engine state is saved. A spurious save is dropped by the batch builder
/// once it sees the server already has the payload.
pub(crate) fn requeue_unacknowledged_upload<F, E>(shared: &Shared<F, E>) -> ExchangeResult<bool>
where
    F: ForkedResource,
    E: RemoteEngine,
{
    let requeued = shared.resource.atomically::<_, ExchangeError, _>(|txn| {
        if !txn.has_fork(&UPLOAD_FORK) || !txn.has_fork(&DOWNLOAD_FORK) {
            return Ok(false);
        }
        let covered = shared
            .engine
            .pending_record_zone_changes()
            .iter()
            .any(|change| change.record_id() == &shared.record_id);
        if covered {
            return Ok(false);
        }
        let upload = txn.content(&UPLOAD_FORK)?;
        if upload == Content::None || upload == txn.content(&DOWNLOAD_FORK)? {
            return Ok(false);
        }
        shared
            .engine
            .add_pending_record_zone_changes(&[PendingRecordZoneChange::SaveRecord(shared.record_id.clone())]);
        Ok(true)
    })?;

    if requeued {
        shared.stats.write().saves_queued += 1;
        info!(record = %shared.record_id, "upload fork not acknowledged by server, save queued again");
    }
    Ok(requeued)
}

/// Monitor task body. Evaluates once, re-queues an upload a restart left
/// without an intent, then evaluates after every local edit of `main`.
pub(crate) async fn run_monitor<F, E>(shared: Arc<Shared<F, E>>, mut changes: ChangeStream, cancel: CancellationToken)
where
    F: ForkedResource,
    E: RemoteEngine,
{
    if let Err(e) = upload_main_if_needed(&shared) {
        shared.record_failure("initial upload check", &e);
    }
    if let Err(e) = requeue_unacknowledged_upload(&shared) {
        shared.record_failure("initial acknowledgement check", &e);
    }

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = changes.next() => event,
        };
        let Some(event) = event else {
            debug!("change feed closed, stopping monitor");
            break;
        };

        if !triggers_upload(&event) {
            trace!(fork = %event.fork, merging = ?event.merging_fork, "ignoring change event");
            continue;
        }
        if let Err(e) = upload_main_if_needed(&shared) {
            shared.record_failure("upload check", &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forks::ensure_sync_forks_exist;
    use forked_core::{CoreError, Fork, ForkedStore};
    use forked_remote::{MemoryRemoteEngine, ZoneId};

    fn record_id() -> RecordId {
        RecordId::new("doc", ZoneId::new("Forked"))
    }

    fn store_with_forks() -> ForkedStore<String> {
        let store = ForkedStore::new();
        store
            .atomically::<_, CoreError, _>(|txn| ensure_sync_forks_exist(txn))
            .unwrap();
        store
    }

    #[test]
    fn local_edits_trigger_upload() {
        assert!(triggers_upload(&ChangeEvent::update(Fork::MAIN)));
        assert!(triggers_upload(&ChangeEvent::merge(Fork::MAIN, Fork::new("other"))));
    }

    #[test]
    fn sync_fork_merges_do_not_trigger_upload() {
        assert!(!triggers_upload(&ChangeEvent::merge(Fork::MAIN, DOWNLOAD_FORK)));
        assert!(!triggers_upload(&ChangeEvent::merge(Fork::MAIN, UPLOAD_FORK)));
        assert!(!triggers_upload(&ChangeEvent::update(DOWNLOAD_FORK)));
        assert!(!triggers_upload(&ChangeEvent::merge(UPLOAD_FORK, Fork::MAIN)));
    }

    #[test]
    fn stages_save_after_edit() {
        let store = store_with_forks();
        let engine = MemoryRemoteEngine::new();
        store.update(&Fork::MAIN, Content::Resource("v1".into())).unwrap();

        let change = store
            .atomically(|txn| stage_upload(txn, &engine, &record_id()))
            .unwrap();
        assert_eq!(change, Some(PendingRecordZoneChange::SaveRecord(record_id())));
        assert_eq!(
            store.content(&UPLOAD_FORK).unwrap(),
            Content::Resource("v1".to_string())
        );
        assert_eq!(engine.pending_record_zone_changes().len(), 1);
    }

    #[test]
    fn stages_delete_after_removal() {
        let store = store_with_forks();
        let engine = MemoryRemoteEngine::new();
        store.update(&Fork::MAIN, Content::Resource("v1".into())).unwrap();
        store.atomically(|txn| stage_upload(txn, &engine, &record_id())).unwrap();
        store.update(&Fork::MAIN, Content::None).unwrap();

        let change = store
            .atomically(|txn| stage_upload(txn, &engine, &record_id()))
            .unwrap();
        assert_eq!(change, Some(PendingRecordZoneChange::DeleteRecord(record_id())));
        assert_eq!(
            engine.pending_record_zone_changes(),
            vec![PendingRecordZoneChange::DeleteRecord(record_id())]
        );
    }

    #[test]
    fn nothing_staged_without_new_commits() {
        let store = store_with_forks();
        let engine = MemoryRemoteEngine::new();
        let change = store
            .atomically(|txn| stage_upload(txn, &engine, &record_id()))
            .unwrap();
        assert_eq!(change, None);
        assert!(engine.pending_record_zone_changes().is_empty());
    }

    #[test]
    fn nothing_staged_without_upload_fork() {
        let store = ForkedStore::<String>::new();
        let engine = MemoryRemoteEngine::new();
        store.update(&Fork::MAIN, Content::Resource("v1".into())).unwrap();
        let change = store
            .atomically(|txn| stage_upload(txn, &engine, &record_id()))
            .unwrap();
        assert_eq!(change, None);
    }

    #[test]
    fn diverged_upload_fork_is_an_error() {
        let store = store_with_forks();
        let engine = MemoryRemoteEngine::new();
        store.update(&Fork::MAIN, Content::Resource("main".into())).unwrap();
        store.update(&UPLOAD_FORK, Content::Resource("upload".into())).unwrap();

        let result = store.atomically(|txn| stage_upload(txn, &engine, &record_id()));
        assert!(matches!(
            result,
            Err(ExchangeError::Core(CoreError::UnexpectedMerge { .. }))
        ));
        assert!(engine.pending_record_zone_changes().is_empty());
    }
}
