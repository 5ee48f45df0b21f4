//! Periodic safety net for both sync directions.

use crate::error::ExchangeResult;
use crate::exchange::Shared;
use crate::forks::DOWNLOAD_FORK;
use crate::monitor::upload_main_if_needed;
use forked_core::{ForkedResource, MergeExpectation, MergeOutcome};
use forked_remote::RemoteEngine;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Merges the download fork into `main`, if the fork exists.
pub(crate) fn merge_download_into_main<F, E>(shared: &Shared<F, E>) -> ExchangeResult<Option<MergeOutcome>>
where
    F: ForkedResource,
    E: RemoteEngine,
{
    shared.resource.atomically(|txn| {
        if !txn.has_fork(&DOWNLOAD_FORK) {
            return Ok(None);
        }
        Ok(Some(txn.merge_into_main(&DOWNLOAD_FORK, MergeExpectation::Any)?))
    })
}

/// One watchdog pass: stage pending local edits, then fold in anything the
/// download fork holds that `main` does not.
pub(crate) fn watchdog_pass<F, E>(shared: &Shared<F, E>)
where
    F: ForkedResource,
    E: RemoteEngine,
{
    if let Err(e) = upload_main_if_needed(shared) {
        shared.record_failure("watchdog upload check", &e);
    }
    match merge_download_into_main(shared) {
        Ok(Some(outcome)) if outcome != MergeOutcome::UpToDate => {
            debug!(%outcome, "watchdog merged download fork into main");
        }
        Ok(_) => {}
        Err(e) => shared.record_failure("watchdog download merge", &e),
    }
}

/// Watchdog task body. Only cancellation stops it.
pub(crate) async fn run_watchdog<F, E>(shared: Arc<Shared<F, E>>, cancel: CancellationToken)
where
    F: ForkedResource,
    E: RemoteEngine,
{
    let interval = shared.config.watchdog_interval;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        watchdog_pass(&shared);
    }
    debug!("watchdog stopped");
}
