//! Error types for the synchronization adapter.

use std::io;
use thiserror::Error;

/// Result type for exchange operations.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Errors that can occur while synchronizing a resource.
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Versioning-core error.
    #[error("resource error: {0}")]
    Core(#[from] forked_core::CoreError),

    /// Remote engine error.
    #[error("remote error: {0}")]
    Remote(#[from] forked_remote::RemoteError),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding a resource failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A remote record carries no resource payload.
    #[error("record {record_id} has no resource data")]
    MissingPayload {
        /// Record identifier.
        record_id: String,
    },

    /// The exchange worker is no longer running.
    #[error("exchange channel closed")]
    ChannelClosed,

    /// The exchange was shut down.
    #[error("exchange cancelled")]
    Cancelled,
}

impl ExchangeError {
    /// Creates a missing payload error.
    pub fn missing_payload(record_id: impl ToString) -> Self {
        Self::MissingPayload {
            record_id: record_id.to_string(),
        }
    }

    /// Returns true if retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::Remote(e) => e.is_retryable(),
            ExchangeError::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forked_core::CoreError;
    use forked_remote::RemoteError;

    #[test]
    fn wraps_lower_layers() {
        let err: ExchangeError = CoreError::fork_not_found("upload").into();
        assert!(err.to_string().contains("upload"));
        assert!(!err.is_retryable());

        let err: ExchangeError = RemoteError::transport_retryable("offline").into();
        assert!(err.is_retryable());
    }

    #[test]
    fn missing_payload_names_record() {
        let err = ExchangeError::missing_payload("Forked/doc");
        assert_eq!(err.to_string(), "record Forked/doc has no resource data");
    }
}
