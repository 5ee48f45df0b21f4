//! The exchange: wiring between a forked resource and a remote engine.

use crate::batch;
use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, ExchangeResult};
use crate::forks::ensure_sync_forks_exist;
use crate::inbound;
use crate::monitor::{self, run_monitor};
use crate::state_file::SyncStateStore;
use crate::stats::ExchangeStats;
use crate::watchdog::{self, run_watchdog};
use forked_core::ForkedResource;
use forked_remote::{
    PendingRecordZoneChange, RecordId, RecordZoneChangeBatch, RemoteEngine, SendChangesContext,
    SyncEvent,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// State shared by the exchange's tasks.
pub(crate) struct Shared<F, E> {
    pub(crate) resource: Arc<F>,
    pub(crate) engine: Arc<E>,
    pub(crate) state_store: SyncStateStore,
    pub(crate) config: ExchangeConfig,
    pub(crate) record_id: RecordId,
    pub(crate) stats: RwLock<ExchangeStats>,
}

impl<F, E> Shared<F, E> {
    pub(crate) fn new(resource: Arc<F>, engine: Arc<E>, config: ExchangeConfig) -> ExchangeResult<Self> {
        let state_store = SyncStateStore::new(&config.state_dir, &config.id)?;
        Ok(Self {
            resource,
            engine,
            state_store,
            record_id: config.record_id(),
            config,
            stats: RwLock::new(ExchangeStats::default()),
        })
    }

    /// Logs a failed step and remembers it as the last error.
    pub(crate) fn record_failure(&self, operation: &str, error: &ExchangeError) {
        error!(resource = %self.config.id, operation, error = %error, "sync step failed");
        self.stats.write().last_error = Some(format!("{operation}: {error}"));
    }
}

/// Commands processed by the worker, in order.
enum Command {
    Event(SyncEvent),
    NextBatch {
        context: SendChangesContext,
        reply: oneshot::Sender<Option<RecordZoneChangeBatch>>,
    },
    Barrier(oneshot::Sender<()>),
}

/// Cloneable handle for delivering engine callbacks to an exchange.
///
/// Callbacks are queued and handled one at a time, in the order sent.
#[derive(Clone)]
pub struct ExchangeHandle {
    sender: mpsc::Sender<Command>,
}

impl ExchangeHandle {
    /// Queues an engine event.
    pub async fn handle_event(&self, event: SyncEvent) -> ExchangeResult<()> {
        self.sender
            .send(Command::Event(event))
            .await
            .map_err(|_| ExchangeError::ChannelClosed)
    }

    /// Asks for the next batch of record changes to send.
    pub async fn next_record_zone_change_batch(
        &self,
        context: SendChangesContext,
    ) -> ExchangeResult<Option<RecordZoneChangeBatch>> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Command::NextBatch { context, reply })
            .await
            .map_err(|_| ExchangeError::ChannelClosed)?;
        response.await.map_err(|_| ExchangeError::Cancelled)
    }

    /// Waits until every command queued before this call has been handled.
    pub async fn barrier(&self) -> ExchangeResult<()> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Command::Barrier(reply))
            .await
            .map_err(|_| ExchangeError::ChannelClosed)?;
        response.await.map_err(|_| ExchangeError::Cancelled)
    }
}

/// Synchronizes one forked resource with a remote change-tracked store.
///
/// Construction makes sure the sync forks exist and starts three tasks on
/// the current tokio runtime:
/// - the monitor, staging local edits of `main` for upload
/// - the watchdog, periodically re-running both sync directions
/// - the worker, handling engine callbacks one at a time
///
/// The engine should be created from the state in [`SyncStateStore::load`]
/// before the exchange starts.
///
/// # Example
///
/// ```ignore
/// let config = ExchangeConfig::new("notes", state_dir);
/// let saved = SyncStateStore::new(&config.state_dir, &config.id)?.load();
/// let engine = Arc::new(MemoryRemoteEngine::with_server(server, saved.state_serialization.as_ref())?);
/// let exchange = CloudExchange::new(resource, engine, config)?;
///
/// let handle = exchange.handle();
/// handle.handle_event(event).await?;
/// let batch = handle.next_record_zone_change_batch(SendChangesContext::scheduled()).await?;
/// ```
pub struct CloudExchange<F: ForkedResource, E: RemoteEngine> {
    shared: Arc<Shared<F, E>>,
    handle: ExchangeHandle,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<F: ForkedResource, E: RemoteEngine> CloudExchange<F, E> {
    /// Creates the exchange and starts its tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(resource: Arc<F>, engine: Arc<E>, config: ExchangeConfig) -> ExchangeResult<Self> {
        let capacity = config.channel_capacity.max(1);
        let shared = Arc::new(Shared::new(resource, engine, config)?);

        if let Err(e) = shared
            .resource
            .atomically::<_, ExchangeError, _>(|txn| Ok(ensure_sync_forks_exist(txn)?))
        {
            shared.record_failure("create sync forks", &e);
        }

        // Subscribe before spawning so no edit slips past the monitor
        let changes = shared.resource.subscribe();
        let cancel = CancellationToken::new();
        let (sender, receiver) = mpsc::channel(capacity);

        let tasks = vec![
            tokio::spawn(run_monitor(Arc::clone(&shared), changes, cancel.clone())),
            tokio::spawn(run_watchdog(Arc::clone(&shared), cancel.clone())),
            tokio::spawn(run_worker(Arc::clone(&shared), receiver, cancel.clone())),
        ];

        info!(
            resource = %shared.config.id,
            record = %shared.record_id,
            state = %shared.state_store.path().display(),
            "exchange started"
        );

        Ok(Self {
            shared,
            handle: ExchangeHandle { sender },
            cancel,
            tasks,
        })
    }

    /// Returns a handle for delivering engine callbacks.
    pub fn handle(&self) -> ExchangeHandle {
        self.handle.clone()
    }

    /// Queues an engine event.
    pub async fn handle_event(&self, event: SyncEvent) -> ExchangeResult<()> {
        self.handle.handle_event(event).await
    }

    /// Asks for the next batch of record changes to send.
    pub async fn next_record_zone_change_batch(
        &self,
        context: SendChangesContext,
    ) -> ExchangeResult<Option<RecordZoneChangeBatch>> {
        self.handle.next_record_zone_change_batch(context).await
    }

    /// Stages `main` for upload now, without waiting for the monitor.
    pub fn upload_main_if_needed(&self) -> ExchangeResult<Option<PendingRecordZoneChange>> {
        monitor::upload_main_if_needed(&self.shared)
    }

    /// Runs one watchdog pass now.
    pub fn run_watchdog_pass(&self) {
        watchdog::watchdog_pass(&self.shared);
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ExchangeConfig {
        &self.shared.config
    }

    /// Returns the identifier of the resource's remote record.
    pub fn record_id(&self) -> &RecordId {
        &self.shared.record_id
    }

    /// Returns the sync state store.
    pub fn state_store(&self) -> &SyncStateStore {
        &self.shared.state_store
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> ExchangeStats {
        self.shared.stats.read().clone()
    }

    /// Stops all tasks and waits for them to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                error!(error = %e, "exchange task failed");
            }
        }
        info!(resource = %self.shared.config.id, "exchange stopped");
    }
}

impl<F: ForkedResource, E: RemoteEngine> Drop for CloudExchange<F, E> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Worker task body.
async fn run_worker<F, E>(shared: Arc<Shared<F, E>>, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken)
where
    F: ForkedResource,
    E: RemoteEngine,
{
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => command,
        };
        let Some(command) = command else {
            break;
        };

        match command {
            Command::Event(event) => {
                debug!(event = event.kind(), "handling sync event");
                inbound::handle_event(&shared, event);
            }
            Command::NextBatch { context, reply } => {
                let next = batch::next_record_zone_change_batch(&shared, &context).await;
                // The caller may have stopped waiting
                let _ = reply.send(next);
            }
            Command::Barrier(reply) => {
                let _ = reply.send(());
            }
        }
    }
    debug!("exchange worker stopped");
}
