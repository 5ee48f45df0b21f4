//! Shared harness for exchange integration tests.

#![allow(dead_code)]

use forked_core::{
    ChangeFeed, ChangeStream, Content, CoreError, Fork, ForkTransaction, ForkedResource,
    ForkedStore, Resource,
};
use forked_exchange::{decode_resource, CloudExchange, ExchangeConfig, SyncStateStore};
use forked_remote::{
    MemoryRemoteEngine, MemoryServer, PendingRecordZoneChange, RecordId, SendChangesContext,
    SentRecordZoneChanges, SyncEvent, ZoneId,
};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const RESOURCE_ID: &str = "doc";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn zone() -> ZoneId {
    ZoneId::new(forked_exchange::DEFAULT_ZONE_NAME)
}

pub fn record_id() -> RecordId {
    RecordId::new(RESOURCE_ID, zone())
}

pub fn save() -> PendingRecordZoneChange {
    PendingRecordZoneChange::SaveRecord(record_id())
}

pub fn delete() -> PendingRecordZoneChange {
    PendingRecordZoneChange::DeleteRecord(record_id())
}

pub fn config(state_dir: &Path) -> ExchangeConfig {
    ExchangeConfig::new(RESOURCE_ID, state_dir)
}

/// A server that already has the default zone.
pub fn server_with_zone() -> Arc<MemoryServer> {
    let server = Arc::new(MemoryServer::new());
    server.create_zone(zone());
    server
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// One device: a store, its engine, and the exchange between them.
pub struct Harness<S: ForkedResource> {
    pub store: Arc<S>,
    pub engine: Arc<MemoryRemoteEngine>,
    pub exchange: CloudExchange<S, MemoryRemoteEngine>,
}

impl<S> Harness<S>
where
    S: ForkedResource,
    S::Resource: std::fmt::Debug,
{
    /// Starts an exchange, restoring the engine from the persisted state.
    pub fn start(store: S, server: Arc<MemoryServer>, config: ExchangeConfig) -> Self {
        init_tracing();
        let store = Arc::new(store);
        let saved = SyncStateStore::new(&config.state_dir, &config.id)
            .unwrap()
            .load();
        let engine = Arc::new(
            MemoryRemoteEngine::with_server(server, saved.state_serialization.as_ref()).unwrap(),
        );
        let exchange = CloudExchange::new(Arc::clone(&store), Arc::clone(&engine), config).unwrap();
        Self {
            store,
            engine,
            exchange,
        }
    }

    pub fn edit(&self, value: S::Resource) {
        self.store.update(&Fork::MAIN, Content::Resource(value)).unwrap();
    }

    pub fn main(&self) -> Content<S::Resource> {
        self.store.content(&Fork::MAIN).unwrap()
    }

    pub fn pending(&self) -> Vec<PendingRecordZoneChange> {
        use forked_remote::RemoteEngine;
        self.engine.pending_record_zone_changes()
    }

    pub async fn wait_for_pending(&self, expected: &[PendingRecordZoneChange]) {
        let reached = wait_until(|| self.pending() == expected).await;
        assert!(reached, "pending changes {:?}, expected {:?}", self.pending(), expected);
    }

    /// Delivers an event and waits until the exchange has handled it.
    pub async fn deliver(&self, event: SyncEvent) {
        self.exchange.handle_event(event).await.unwrap();
        self.exchange.handle().barrier().await.unwrap();
    }

    /// Runs one send the way the engine would: zone changes first, then a
    /// record batch, reporting each outcome and the new engine state.
    pub async fn send_cycle(&self) -> Option<SentRecordZoneChanges> {
        let database = self.engine.accept_database_changes();
        self.deliver(SyncEvent::SentDatabaseChanges(database)).await;

        let batch = self
            .exchange
            .next_record_zone_change_batch(SendChangesContext::scheduled())
            .await
            .unwrap()?;
        let sent = self.engine.accept_batch(&batch);
        self.deliver(SyncEvent::SentRecordZoneChanges(sent.clone())).await;
        self.deliver(self.engine.state_update().unwrap()).await;
        Some(sent)
    }

    /// Decodes the server's copy of the record.
    pub fn server_value(&self) -> Option<S::Resource> {
        self.engine
            .server()
            .record(&record_id())
            .map(|record| decode_resource(&record).unwrap())
    }
}

/// A store wrapper that can hide its change feed or fail one section.
pub struct Instrumented<R: Resource> {
    pub inner: ForkedStore<R>,
    observed: bool,
    fail_next: AtomicBool,
}

impl<R: Resource> Instrumented<R> {
    /// Wraps `inner`; with `observed` false, subscribers never see an event.
    pub fn new(inner: ForkedStore<R>, observed: bool) -> Self {
        Self {
            inner,
            observed,
            fail_next: AtomicBool::new(false),
        }
    }

    /// Makes the next atomic section fail before it runs.
    pub fn fail_next_section(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl<R: Resource> ForkedResource for Instrumented<R> {
    type Resource = R;

    fn atomically<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn ForkTransaction<R>) -> Result<T, E>,
        E: From<CoreError>,
    {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(E::from(CoreError::Io(io::Error::other("injected failure"))));
        }
        self.inner.atomically(f)
    }

    fn subscribe(&self) -> ChangeStream {
        if self.observed {
            self.inner.subscribe()
        } else {
            ChangeFeed::new().subscribe()
        }
    }
}
