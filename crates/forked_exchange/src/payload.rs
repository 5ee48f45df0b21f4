//! Resource payload encoding.

use crate::error::{ExchangeError, ExchangeResult};
use forked_remote::RemoteRecord;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a resource for the record's `resourceData` field.
pub fn encode_resource<R: Serialize>(resource: &R) -> ExchangeResult<Vec<u8>> {
    let mut data = Vec::new();
    ciborium::into_writer(resource, &mut data).map_err(|e| ExchangeError::Codec(e.to_string()))?;
    Ok(data)
}

/// Decodes the resource carried by `record`.
pub fn decode_resource<R: DeserializeOwned>(record: &RemoteRecord) -> ExchangeResult<R> {
    let data = record
        .resource_data()
        .ok_or_else(|| ExchangeError::missing_payload(&record.record_id))?;
    ciborium::from_reader(data).map_err(|e| ExchangeError::Codec(e.to_string()))
}
