//! Exchange statistics.

/// Counters describing what an exchange has done since it started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Save intents queued after local edits.
    pub saves_queued: u64,
    /// Delete intents queued after local removals.
    pub deletes_queued: u64,
    /// Records placed in outbound batches.
    pub records_batched: u64,
    /// Save intents dropped because the remote payload was already current.
    pub unchanged_skipped: u64,
    /// Remote records confirmed saved.
    pub records_saved: u64,
    /// Remote modifications applied locally.
    pub records_downloaded: u64,
    /// Remote deletions applied locally.
    pub remote_deletions: u64,
    /// Write conflicts merged and re-queued.
    pub conflicts_resolved: u64,
    /// Recoveries from a missing or deleted zone.
    pub zone_recoveries: u64,
    /// Remote payloads that could not be decoded.
    pub decode_failures: u64,
    /// Last error message.
    pub last_error: Option<String>,
}
