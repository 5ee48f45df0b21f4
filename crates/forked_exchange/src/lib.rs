//! # Forked Exchange
//!
//! Keeps a forked resource in sync with a remote, change-tracked record
//! store.
//!
//! This crate provides:
//! - `CloudExchange`, the adapter object driving both sync directions
//! - Sync fork lifecycle (`upload`, `download`)
//! - The outbound change monitor and the watchdog
//! - Outbound batch building with idempotent payload diffing
//! - Inbound change handling through the download fork
//! - Conflict and missing-zone recovery
//! - Durable persistence of the engine's sync state
//!
//! ## Data flow
//!
//! ```text
//! local edit ─► main ─► (monitor) ─► upload ─► pending SaveRecord ─► batch
//! remote change ─► download ─► merge ─► main
//! ```
//!
//! ## Key Invariants
//!
//! - The persisted sync state never describes progress beyond what the
//!   resource has durably stored
//! - At most one pending intent per record
//! - Remote content only reaches `main` through a merge from `download`
//! - Merges from the sync forks never trigger an upload

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod config;
mod conflict;
mod error;
mod exchange;
mod forks;
mod inbound;
mod monitor;
mod payload;
mod state_file;
mod stats;
mod watchdog;

pub use config::{
    ExchangeConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_RECORD_TYPE, DEFAULT_WATCHDOG_INTERVAL,
    DEFAULT_ZONE_NAME,
};
pub use conflict::FailureKind;
pub use error::{ExchangeError, ExchangeResult};
pub use exchange::{CloudExchange, ExchangeHandle};
pub use forks::{
    ensure_sync_forks_exist, is_sync_fork, tear_down_sync_forks, DOWNLOAD_FORK, SYNC_FORKS,
    UPLOAD_FORK,
};
pub use inbound::apply_downloaded;
pub use monitor::{stage_upload, triggers_upload};
pub use payload::{decode_resource, encode_resource};
pub use state_file::{PersistedSyncState, SyncStateStore};
pub use stats::ExchangeStats;
