//! Error types for the remote engine.

use thiserror::Error;

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors reported by a remote engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// No account is signed in.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A state serialization could not be restored.
    #[error("invalid state serialization: {0}")]
    InvalidStateSerialization(String),
}

impl RemoteError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Transport { retryable, .. } => *retryable,
            RemoteError::NotAuthenticated => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(RemoteError::transport_retryable("connection lost").is_retryable());
        assert!(!RemoteError::transport_fatal("invalid certificate").is_retryable());
        assert!(RemoteError::NotAuthenticated.is_retryable());
        assert!(!RemoteError::Codec("bad".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = RemoteError::InvalidStateSerialization("truncated".into());
        assert_eq!(err.to_string(), "invalid state serialization: truncated");
    }
}
