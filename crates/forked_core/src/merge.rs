//! Three-way merging of fork content.
//!
//! A [`Merger`] combines two diverged resource values given their common
//! ancestor. [`merge_content`] wraps a merger with the rules shared by every
//! resource type: unchanged sides yield to changed ones, and a concurrent edit
//! wins over a removal so no edited data is lost.
//!
//! Record-shaped resources can use [`FieldRecord`] with a
//! [`FieldMergePolicy`], which picks a [`MergeAlgorithm`] per field. The
//! policy is checked against the record's declared fields when it is built.

use crate::error::{CoreError, CoreResult};
use crate::fork::Content;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Combines two diverged values of a resource.
///
/// `ours` is the fork being merged into, `theirs` the fork being merged from.
pub trait Merger<R>: Send + Sync {
    /// Returns the merged value.
    fn merge(&self, ancestor: Option<&R>, ours: &R, theirs: &R) -> CoreResult<R>;
}

/// Resolves every conflict in favor of the incoming side.
#[derive(Debug, Clone, Copy, Default)]
pub struct MostRecentMerger;

impl<R: Clone> Merger<R> for MostRecentMerger {
    fn merge(&self, _ancestor: Option<&R>, _ours: &R, theirs: &R) -> CoreResult<R> {
        Ok(theirs.clone())
    }
}

/// Three-way merges fork content.
pub fn merge_content<R: Clone + PartialEq>(
    merger: &dyn Merger<R>,
    ancestor: &Content<R>,
    ours: &Content<R>,
    theirs: &Content<R>,
) -> CoreResult<Content<R>> {
    if ours == theirs || theirs == ancestor {
        return Ok(ours.clone());
    }
    if ours == ancestor {
        return Ok(theirs.clone());
    }

    match (ours, theirs) {
        (Content::Resource(ours), Content::Resource(theirs)) => Ok(Content::Resource(
            merger.merge(ancestor.resource(), ours, theirs)?,
        )),
        // Edited on one side, removed on the other: keep the edit.
        (Content::Resource(kept), Content::None) | (Content::None, Content::Resource(kept)) => {
            Ok(Content::Resource(kept.clone()))
        }
        (Content::None, Content::None) => Ok(Content::None),
    }
}

/// Merge algorithm applied to one field of a [`FieldRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeAlgorithm {
    /// The incoming value wins.
    MostRecent,
    /// The value already in the target fork wins.
    PreferLocal,
    /// Lists are merged as sets: additions from both sides are kept,
    /// removals from either side are applied.
    SetUnion,
    /// Integers are merged by adding both sides' deltas.
    Counter,
}

/// A single field value of a [`FieldRecord`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldValue {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    List(Vec<FieldValue>),
}

/// A resource made of named fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl FieldRecord {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, returning the record for chaining.
    pub fn with(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.set(name, value);
        self
    }

    /// Sets a field.
    pub fn set(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Removes a field.
    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    /// Gets a field.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Iterates over field names.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// Per-field merge configuration for [`FieldRecord`] resources.
///
/// Fields without an explicit algorithm use the policy's default.
#[derive(Debug, Clone)]
pub struct FieldMergePolicy {
    declared: BTreeSet<String>,
    algorithms: BTreeMap<String, MergeAlgorithm>,
    default: MergeAlgorithm,
}

impl FieldMergePolicy {
    /// Creates a policy for a record declaring `declared_fields`.
    ///
    /// Fails if an algorithm is configured for an undeclared field.
    pub fn new<I, S>(declared_fields: I, algorithms: BTreeMap<String, MergeAlgorithm>) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let declared: BTreeSet<String> = declared_fields.into_iter().map(Into::into).collect();

        let unknown: Vec<&str> = algorithms
            .keys()
            .filter(|name| !declared.contains(*name))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(CoreError::InvalidMergePolicy(format!(
                "undeclared fields: {}",
                unknown.join(", ")
            )));
        }

        Ok(Self {
            declared,
            algorithms,
            default: MergeAlgorithm::MostRecent,
        })
    }

    /// Sets the algorithm for fields without an explicit entry.
    pub fn with_default(mut self, algorithm: MergeAlgorithm) -> Self {
        self.default = algorithm;
        self
    }

    /// Returns the algorithm used for `field`.
    pub fn algorithm_for(&self, field: &str) -> MergeAlgorithm {
        self.algorithms.get(field).copied().unwrap_or(self.default)
    }

    /// Returns true if `field` is declared.
    pub fn declares(&self, field: &str) -> bool {
        self.declared.contains(field)
    }

    fn merge_field(
        &self,
        field: &str,
        ancestor: Option<&FieldValue>,
        ours: Option<&FieldValue>,
        theirs: Option<&FieldValue>,
    ) -> CoreResult<Option<FieldValue>> {
        if ours == theirs || theirs == ancestor {
            return Ok(ours.cloned());
        }
        if ours == ancestor {
            return Ok(theirs.cloned());
        }

        match self.algorithm_for(field) {
            MergeAlgorithm::MostRecent => Ok(theirs.cloned()),
            MergeAlgorithm::PreferLocal => Ok(ours.cloned()),
            MergeAlgorithm::SetUnion => {
                let ancestor = as_list(field, ancestor)?;
                let ours = as_list(field, ours)?;
                let theirs = as_list(field, theirs)?;

                let mut merged: Vec<FieldValue> = ours
                    .iter()
                    .filter(|item| !(ancestor.contains(item) && !theirs.contains(item)))
                    .cloned()
                    .collect();
                for item in theirs {
                    if !ours.contains(item) && !ancestor.contains(item) && !merged.contains(item) {
                        merged.push(item.clone());
                    }
                }
                Ok(Some(FieldValue::List(merged)))
            }
            MergeAlgorithm::Counter => {
                let ancestor = as_integer(field, ancestor)?;
                let ours = as_integer(field, ours)?;
                let theirs = as_integer(field, theirs)?;
                let merged = theirs
                    .checked_sub(ancestor)
                    .and_then(|delta| ours.checked_add(delta))
                    .ok_or_else(|| {
                        CoreError::merge_failed(format!("counter overflow in field {field}"))
                    })?;
                Ok(Some(FieldValue::Integer(merged)))
            }
        }
    }
}

fn as_list<'a>(field: &str, value: Option<&'a FieldValue>) -> CoreResult<&'a [FieldValue]> {
    match value {
        None => Ok(&[]),
        Some(FieldValue::List(items)) => Ok(items),
        Some(other) => Err(CoreError::merge_failed(format!(
            "set-union field {field} holds a non-list value: {other:?}"
        ))),
    }
}

fn as_integer(field: &str, value: Option<&FieldValue>) -> CoreResult<i64> {
    match value {
        None => Ok(0),
        Some(FieldValue::Integer(n)) => Ok(*n),
        Some(other) => Err(CoreError::merge_failed(format!(
            "counter field {field} holds a non-integer value: {other:?}"
        ))),
    }
}

impl Merger<FieldRecord> for FieldMergePolicy {
    fn merge(
        &self,
        ancestor: Option<&FieldRecord>,
        ours: &FieldRecord,
        theirs: &FieldRecord,
    ) -> CoreResult<FieldRecord> {
        let names: BTreeSet<&str> = ours
            .field_names()
            .chain(theirs.field_names())
            .chain(ancestor.into_iter().flat_map(FieldRecord::field_names))
            .collect();

        let mut merged = FieldRecord::new();
        for name in names {
            let value = self.merge_field(
                name,
                ancestor.and_then(|record| record.get(name)),
                ours.get(name),
                theirs.get(name),
            )?;
            if let Some(value) = value {
                merged.set(name, value);
            }
        }
        Ok(merged)
    }
}
