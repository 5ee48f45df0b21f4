//! Forks, fork content and merge outcomes.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// A named branch of a resource's history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fork(Cow<'static, str>);

impl Fork {
    /// The user-visible fork. Always present.
    pub const MAIN: Fork = Fork(Cow::Borrowed("main"));

    /// Creates a fork name from a static string.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Creates a fork name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// Returns the fork name.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Returns true for `main`.
    pub fn is_main(&self) -> bool {
        self.name() == Self::MAIN.name()
    }
}

impl fmt::Display for Fork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The materialized value of a fork.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Content<R> {
    /// No content: the resource is empty or was removed.
    None,
    /// The resource value.
    Resource(R),
}

impl<R> Content<R> {
    /// Returns the resource, if present.
    pub fn resource(&self) -> Option<&R> {
        match self {
            Content::None => None,
            Content::Resource(resource) => Some(resource),
        }
    }

    /// Consumes the content, returning the resource if present.
    pub fn into_resource(self) -> Option<R> {
        match self {
            Content::None => None,
            Content::Resource(resource) => Some(resource),
        }
    }

    /// Returns true if there is no resource.
    pub fn is_none(&self) -> bool {
        matches!(self, Content::None)
    }
}

impl<R> From<Option<R>> for Content<R> {
    fn from(value: Option<R>) -> Self {
        match value {
            Some(resource) => Content::Resource(resource),
            None => Content::None,
        }
    }
}

/// The kind of merge that was performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The target already contained the source.
    UpToDate,
    /// The target only had to move its head forward.
    FastForward,
    /// Both sides had diverged and were combined.
    ThreeWay,
}

impl fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergeOutcome::UpToDate => "up-to-date",
            MergeOutcome::FastForward => "fast-forward",
            MergeOutcome::ThreeWay => "three-way",
        })
    }
}

/// The merge kind a caller declares before merging.
///
/// A merge that would violate the expectation fails before touching any fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeExpectation {
    /// Any kind of merge is acceptable.
    Any,
    /// The target must already be up to date or fast-forwardable.
    FastForward,
}

impl MergeExpectation {
    /// Returns true if `outcome` satisfies this expectation.
    pub fn permits(&self, outcome: MergeOutcome) -> bool {
        match self {
            MergeExpectation::Any => true,
            MergeExpectation::FastForward => outcome != MergeOutcome::ThreeWay,
        }
    }
}

impl fmt::Display for MergeExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergeExpectation::Any => "any",
            MergeExpectation::FastForward => "fast-forward",
        })
    }
}
