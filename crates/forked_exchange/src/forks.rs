//! Sync fork lifecycle.

use forked_core::{CoreResult, Fork, ForkTransaction, MergeExpectation};
use tracing::debug;

/// Fork holding the state last staged for upload.
pub const UPLOAD_FORK: Fork = Fork::from_static("upload");

/// Fork holding the state last received from the remote store.
pub const DOWNLOAD_FORK: Fork = Fork::from_static("download");

/// The sync forks, in teardown order.
pub const SYNC_FORKS: [Fork; 2] = [UPLOAD_FORK, DOWNLOAD_FORK];

/// Returns true for the forks owned by the exchange.
pub fn is_sync_fork(fork: &Fork) -> bool {
    SYNC_FORKS.contains(fork)
}

/// Creates each sync fork that does not exist yet.
pub fn ensure_sync_forks_exist<R>(txn: &mut dyn ForkTransaction<R>) -> CoreResult<()> {
    for fork in &SYNC_FORKS {
        if !txn.has_fork(fork) {
            txn.create_fork(fork)?;
            debug!(fork = %fork, "created sync fork");
        }
    }
    Ok(())
}

/// Merges each existing sync fork into `main`, then deletes it.
pub fn tear_down_sync_forks<R>(txn: &mut dyn ForkTransaction<R>) -> CoreResult<()> {
    for fork in &SYNC_FORKS {
        if txn.has_fork(fork) {
            let outcome = txn.merge_into_main(fork, MergeExpectation::Any)?;
            txn.delete_fork(fork)?;
            debug!(fork = %fork, %outcome, "tore down sync fork");
        }
    }
    Ok(())
}
