//! # Forked Core
//!
//! Fork/merge versioning core for a single synchronized resource.
//!
//! This crate provides:
//! - Named forks of a resource's history (`main` plus any number of others)
//! - Fast-forward and three-way merges between `main` and a fork
//! - Atomic transactions over all forks
//! - A change feed announcing every committed update or merge
//! - Field-level merge policies for record-shaped resources
//!
//! ## Model
//!
//! Every fork other than `main` remembers the `main` version it last agreed
//! with (its common ancestor). Merging in either direction compares both
//! heads against that ancestor:
//! - neither side moved: up to date
//! - only one side moved: fast-forward
//! - both moved: three-way merge through a [`Merger`]
//!
//! ## Key Invariants
//!
//! - `main` always exists and can never be created or deleted
//! - Transactions commit all-or-nothing
//! - Change events are emitted only after commit, in commit order

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod error;
mod fork;
pub mod merge;
mod resource;
mod store;

pub use change_feed::{ChangeEvent, ChangeFeed, ChangeStream};
pub use error::{CoreError, CoreResult};
pub use fork::{Content, Fork, MergeExpectation, MergeOutcome};
pub use merge::{FieldMergePolicy, FieldRecord, FieldValue, MergeAlgorithm, Merger, MostRecentMerger};
pub use resource::{ForkTransaction, ForkedResource, Resource};
pub use store::ForkedStore;
