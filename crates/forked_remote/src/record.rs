//! Remote records.

use crate::ids::RecordId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key of the encrypted field holding a serialized resource.
pub const RESOURCE_DATA_KEY: &str = "resourceData";

/// A record as stored by the remote service.
///
/// `change_tag` is assigned by the server on every successful save. A save
/// whose tag does not match the server's current tag is rejected as a
/// conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Record identifier.
    pub record_id: RecordId,
    /// Record type.
    pub record_type: String,
    /// Server change tag, `None` for records never saved.
    pub change_tag: Option<String>,
    /// Encrypted key/value fields.
    pub encrypted_values: BTreeMap<String, Vec<u8>>,
}

impl RemoteRecord {
    /// Creates an empty, never-saved record.
    pub fn new(record_type: impl Into<String>, record_id: RecordId) -> Self {
        Self {
            record_id,
            record_type: record_type.into(),
            change_tag: None,
            encrypted_values: BTreeMap::new(),
        }
    }

    /// Returns the serialized resource, if present.
    pub fn resource_data(&self) -> Option<&[u8]> {
        self.encrypted_values
            .get(RESOURCE_DATA_KEY)
            .map(Vec::as_slice)
    }

    /// Sets the serialized resource.
    pub fn set_resource_data(&mut self, data: Vec<u8>) {
        self.encrypted_values
            .insert(RESOURCE_DATA_KEY.to_string(), data);
    }

    /// Returns the record with the serialized resource set.
    pub fn with_resource_data(mut self, data: Vec<u8>) -> Self {
        self.set_resource_data(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ZoneId;

    #[test]
    fn resource_data_field() {
        let mut record = RemoteRecord::new("ForkedResource", RecordId::new("doc", ZoneId::new("z")));
        assert_eq!(record.resource_data(), None);

        record.set_resource_data(vec![1, 2, 3]);
        assert_eq!(record.resource_data(), Some(&[1u8, 2, 3][..]));
        assert!(record.encrypted_values.contains_key(RESOURCE_DATA_KEY));
    }
}
