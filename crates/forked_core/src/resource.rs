//! The versioning-core interface consumed by sync adapters.

use crate::change_feed::ChangeStream;
use crate::error::{CoreError, CoreResult};
use crate::fork::{Content, Fork, MergeExpectation, MergeOutcome};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Values that can be stored in a forked resource.
pub trait Resource: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Resource for T where T: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Operations available inside an atomic section.
///
/// Every change made through a transaction becomes visible, durable (after
/// [`ForkTransaction::flush`]) and announced on the change feed only if the
/// enclosing section succeeds.
pub trait ForkTransaction<R> {
    /// Returns true if `fork` exists.
    fn has_fork(&self, fork: &Fork) -> bool;

    /// Creates `fork` at the current head of `main`.
    fn create_fork(&mut self, fork: &Fork) -> CoreResult<()>;

    /// Deletes `fork` and any commits only it referenced.
    fn delete_fork(&mut self, fork: &Fork) -> CoreResult<()>;

    /// Returns the current content of `fork`.
    fn content(&self, fork: &Fork) -> CoreResult<Content<R>>;

    /// Commits new content to `fork`.
    fn update(&mut self, fork: &Fork, content: Content<R>) -> CoreResult<()>;

    /// Commits empty content to `fork`.
    fn remove_content(&mut self, fork: &Fork) -> CoreResult<()> {
        self.update(fork, Content::None)
    }

    /// Returns true if `main` has commits that `fork` has not merged yet.
    fn has_unmerged_commits_in_main(&self, fork: &Fork) -> CoreResult<bool>;

    /// Returns true if `fork` has commits that `main` has not merged yet.
    fn has_unmerged_commits(&self, fork: &Fork) -> CoreResult<bool>;

    /// Merges the history of `main` into `into`.
    fn merge_from_main(&mut self, into: &Fork, expectation: MergeExpectation) -> CoreResult<MergeOutcome>;

    /// Merges the history of `from` into `main`.
    fn merge_into_main(&mut self, from: &Fork, expectation: MergeExpectation) -> CoreResult<MergeOutcome>;

    /// Forces the resource's state, as seen by this transaction, to disk.
    fn flush(&mut self) -> CoreResult<()>;
}

/// A resource stored under a fork/merge version model.
pub trait ForkedResource: Send + Sync + 'static {
    /// The stored value type.
    type Resource: Resource;

    /// Runs `f` as one exclusive transaction.
    ///
    /// No two sections of the same resource interleave. If `f` fails, none of
    /// its changes are kept.
    fn atomically<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn ForkTransaction<Self::Resource>) -> Result<T, E>,
        E: From<CoreError>;

    /// Subscribes to change events committed from now on.
    fn subscribe(&self) -> ChangeStream;

    /// Returns true if `fork` exists.
    fn has_fork(&self, fork: &Fork) -> bool {
        self.atomically::<_, CoreError, _>(|txn| Ok(txn.has_fork(fork)))
            .unwrap_or(false)
    }

    /// Returns the current content of `fork`.
    fn content(&self, fork: &Fork) -> CoreResult<Content<Self::Resource>> {
        self.atomically(|txn| txn.content(fork))
    }

    /// Commits new content to `fork` in its own transaction.
    fn update(&self, fork: &Fork, content: Content<Self::Resource>) -> CoreResult<()> {
        self.atomically(|txn| txn.update(fork, content))
    }
}
