//! Zone and record identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a record zone in the remote database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(String);

impl ZoneId {
    /// Creates a zone identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the zone name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a record: a record name within a zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    /// Zone holding the record.
    pub zone_id: ZoneId,
    /// Record name, unique within the zone.
    pub record_name: String,
}

impl RecordId {
    /// Creates a record identifier.
    pub fn new(record_name: impl Into<String>, zone_id: ZoneId) -> Self {
        Self {
            zone_id,
            record_name: record_name.into(),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.zone_id, self.record_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_display() {
        let id = RecordId::new("doc", ZoneId::new("Forked"));
        assert_eq!(id.to_string(), "Forked/doc");
        assert_eq!(id.zone_id.name(), "Forked");
    }
}
