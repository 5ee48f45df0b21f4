//! Integration tests for local edits that land while a send is in flight.

mod common;

use async_trait::async_trait;
use common::{config, init_tracing, record_id, save, server_with_zone, wait_until};
use forked_core::{Content, Fork, ForkedResource, ForkedStore};
use forked_exchange::{decode_resource, stage_upload, CloudExchange, ExchangeError, UPLOAD_FORK};
use forked_remote::{
    MemoryRemoteEngine, MemoryServer, PendingDatabaseChange, PendingRecordZoneChange, RecordId,
    RemoteEngine, RemoteRecord, RemoteResult, SendChangesContext, SentRecordZoneChanges,
    StateSerialization, SyncEvent,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::tempdir;

/// Engine that commits a local edit to `main` while a fetch is in flight.
struct EditDuringFetch {
    inner: MemoryRemoteEngine,
    store: Arc<ForkedStore<String>>,
    edit: Mutex<Option<String>>,
}

impl EditDuringFetch {
    fn new(server: Arc<MemoryServer>, store: Arc<ForkedStore<String>>) -> Self {
        Self {
            inner: MemoryRemoteEngine::with_server(server, None).unwrap(),
            store,
            edit: Mutex::new(None),
        }
    }

    fn edit_on_next_fetch(&self, value: &str) {
        *self.edit.lock() = Some(value.to_string());
    }
}

#[async_trait]
impl RemoteEngine for EditDuringFetch {
    fn add_pending_record_zone_changes(&self, changes: &[PendingRecordZoneChange]) {
        self.inner.add_pending_record_zone_changes(changes);
    }

    fn remove_pending_record_zone_changes(&self, changes: &[PendingRecordZoneChange]) {
        self.inner.remove_pending_record_zone_changes(changes);
    }

    fn pending_record_zone_changes(&self) -> Vec<PendingRecordZoneChange> {
        self.inner.pending_record_zone_changes()
    }

    fn add_pending_database_changes(&self, changes: &[PendingDatabaseChange]) {
        self.inner.add_pending_database_changes(changes);
    }

    fn remove_pending_database_changes(&self, changes: &[PendingDatabaseChange]) {
        self.inner.remove_pending_database_changes(changes);
    }

    fn pending_database_changes(&self) -> Vec<PendingDatabaseChange> {
        self.inner.pending_database_changes()
    }

    fn state_serialization(&self) -> RemoteResult<StateSerialization> {
        self.inner.state_serialization()
    }

    async fn fetch_record(&self, record_id: &RecordId) -> RemoteResult<Option<RemoteRecord>> {
        let edit = self.edit.lock().take();
        if let Some(value) = edit {
            // Edit and stage it the way the monitor would
            self.store
                .atomically::<_, ExchangeError, _>(|txn| {
                    txn.update(&Fork::MAIN, Content::Resource(value))?;
                    stage_upload(txn, self, record_id)?;
                    Ok(())
                })
                .unwrap();
        }
        self.inner.fetch_record(record_id).await
    }
}

struct Device {
    store: Arc<ForkedStore<String>>,
    engine: Arc<EditDuringFetch>,
    exchange: CloudExchange<ForkedStore<String>, EditDuringFetch>,
}

impl Device {
    fn start(state_dir: &std::path::Path) -> Self {
        init_tracing();
        let store = Arc::new(ForkedStore::<String>::new());
        let engine = Arc::new(EditDuringFetch::new(server_with_zone(), Arc::clone(&store)));
        let exchange =
            CloudExchange::new(Arc::clone(&store), Arc::clone(&engine), config(state_dir))
                .unwrap();
        Self {
            store,
            engine,
            exchange,
        }
    }

    async fn deliver(&self, event: SyncEvent) {
        self.exchange.handle_event(event).await.unwrap();
        self.exchange.handle().barrier().await.unwrap();
    }

    async fn send(&self) -> SentRecordZoneChanges {
        let batch = self
            .exchange
            .next_record_zone_change_batch(SendChangesContext::scheduled())
            .await
            .unwrap()
            .expect("a batch");
        let sent = self.engine.inner.accept_batch(&batch);
        self.deliver(SyncEvent::SentRecordZoneChanges(sent.clone())).await;
        sent
    }

    fn server_value(&self) -> Option<String> {
        self.engine
            .inner
            .server()
            .record(&record_id())
            .map(|record| decode_resource(&record).unwrap())
    }

    async fn wait_for_pending(&self, expected: &[PendingRecordZoneChange]) {
        let reached = wait_until(|| self.engine.pending_record_zone_changes() == expected).await;
        assert!(reached, "pending {:?}", self.engine.pending_record_zone_changes());
    }
}

#[tokio::test]
async fn edit_staged_during_fetch_is_sent() {
    let dir = tempdir().unwrap();
    let device = Device::start(dir.path());

    device.store.update(&Fork::MAIN, Content::Resource("v1".into())).unwrap();
    device.wait_for_pending(&[save()]).await;
    device.send().await;
    assert_eq!(device.server_value(), Some("v1".to_string()));
    assert!(device.engine.pending_record_zone_changes().is_empty());

    // A save intent for bytes the server has, with an edit arriving mid-fetch
    device.engine.add_pending_record_zone_changes(&[save()]);
    device.engine.edit_on_next_fetch("v2");

    let batch = device
        .exchange
        .next_record_zone_change_batch(SendChangesContext::scheduled())
        .await
        .unwrap()
        .expect("the new edit is sent");
    let sent_value: String = decode_resource(&batch.records_to_save[0]).unwrap();
    assert_eq!(sent_value, "v2");
    assert_eq!(device.engine.pending_record_zone_changes(), vec![save()]);
    assert_eq!(device.exchange.stats().unchanged_skipped, 0);

    let sent = device.engine.inner.accept_batch(&batch);
    device.deliver(SyncEvent::SentRecordZoneChanges(sent)).await;
    assert_eq!(device.server_value(), Some("v2".to_string()));
    assert!(device.engine.pending_record_zone_changes().is_empty());
}

#[tokio::test]
async fn edit_staged_before_acknowledgement_is_queued_again() {
    let dir = tempdir().unwrap();
    let device = Device::start(dir.path());

    device.store.update(&Fork::MAIN, Content::Resource("v1".into())).unwrap();
    device.wait_for_pending(&[save()]).await;
    let batch = device
        .exchange
        .next_record_zone_change_batch(SendChangesContext::scheduled())
        .await
        .unwrap()
        .expect("a batch");

    // Staged after the batch was built; folds into the intent being sent
    device.store.update(&Fork::MAIN, Content::Resource("v2".into())).unwrap();
    let staged = wait_until(|| {
        device.store.content(&UPLOAD_FORK).unwrap() == Content::Resource("v2".to_string())
    })
    .await;
    assert!(staged);

    let sent = device.engine.inner.accept_batch(&batch);
    assert!(device.engine.pending_record_zone_changes().is_empty());
    device.deliver(SyncEvent::SentRecordZoneChanges(sent)).await;
    assert_eq!(device.server_value(), Some("v1".to_string()));
    assert_eq!(device.engine.pending_record_zone_changes(), vec![save()]);

    device.send().await;
    assert_eq!(device.server_value(), Some("v2".to_string()));
    assert!(device.engine.pending_record_zone_changes().is_empty());
}
