//! # Forked Remote
//!
//! Types describing a remote, change-tracked record store and the engine that
//! talks to it.
//!
//! This crate provides:
//! - Zone and record identifiers, `RemoteRecord`
//! - Pending record/zone changes with per-record coalescing
//! - The engine's opaque `StateSerialization`
//! - Events the engine delivers to its delegate
//! - The `RemoteEngine` trait and an in-memory `MemoryRemoteEngine`
//!
//! Transport, retry/backoff and authentication belong to the engine
//! implementation; this crate performs no network I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changes;
mod engine;
mod error;
mod event;
mod ids;
mod record;

pub use changes::{PendingChanges, PendingDatabaseChange, PendingRecordZoneChange};
pub use engine::{EngineState, MemoryRemoteEngine, MemoryServer, RemoteEngine, StateSerialization};
pub use error::{RemoteError, RemoteResult};
pub use event::{
    AccountChange, AccountChangeType, FailedRecordDelete, FailedRecordSave, FailedZoneSave,
    FetchedDatabaseChanges, FetchedRecordZoneChanges, RecordDeletion, RecordError,
    RecordErrorCode, RecordZoneChangeBatch, SendChangesContext, SendScope,
    SentDatabaseChanges, SentRecordZoneChanges, SyncEvent, SyncReason, ZoneDeletion,
    ZoneDeletionReason,
};
pub use ids::{RecordId, ZoneId};
pub use record::{RemoteRecord, RESOURCE_DATA_KEY};
