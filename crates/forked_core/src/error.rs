//! Error types for the versioning core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in versioning core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The named fork does not exist.
    #[error("fork not found: {fork}")]
    ForkNotFound {
        /// Name of the fork.
        fork: String,
    },

    /// The named fork already exists.
    #[error("fork already exists: {fork}")]
    ForkExists {
        /// Name of the fork.
        fork: String,
    },

    /// `main` cannot be created, deleted or merged with itself.
    #[error("operation not permitted on the main fork")]
    MainForkReserved,

    /// A merge did not have the kind the caller declared.
    #[error("unexpected {actual} merge of fork {fork} (expected {expected})")]
    UnexpectedMerge {
        /// Fork taking part in the merge.
        fork: String,
        /// Declared expectation.
        expected: String,
        /// Merge kind that would have been performed.
        actual: String,
    },

    /// A merge policy names fields the resource does not declare.
    #[error("invalid merge policy: {0}")]
    InvalidMergePolicy(String),

    /// Three-way merge could not combine the two sides.
    #[error("merge failed: {0}")]
    MergeFailed(String),

    /// Encoding or decoding a snapshot failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The on-disk snapshot could not be read back.
    #[error("snapshot corrupted: {0}")]
    CorruptSnapshot(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    /// Creates a fork-not-found error.
    pub fn fork_not_found(fork: impl Into<String>) -> Self {
        Self::ForkNotFound { fork: fork.into() }
    }

    /// Creates a fork-exists error.
    pub fn fork_exists(fork: impl Into<String>) -> Self {
        Self::ForkExists { fork: fork.into() }
    }

    /// Creates a merge-failed error.
    pub fn merge_failed(message: impl Into<String>) -> Self {
        Self::MergeFailed(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::fork_not_found("upload");
        assert_eq!(err.to_string(), "fork not found: upload");

        let err = CoreError::UnexpectedMerge {
            fork: "upload".into(),
            expected: "fast-forward".into(),
            actual: "three-way".into(),
        };
        assert!(err.to_string().contains("three-way"));
        assert!(err.to_string().contains("upload"));
    }
}
