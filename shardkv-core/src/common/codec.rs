//! bincode helpers for log entries, snapshots and migration payloads

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error_context::SerializationContext;
use crate::error::ShardKvResult;

/// Encode a value for the replicated log or a snapshot
pub fn encode<T: Serialize>(value: &T, what: &str) -> ShardKvResult<Vec<u8>> {
    bincode::serialize(value).serialize_context(what)
}

/// Decode a value produced by [`encode`]
pub fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> ShardKvResult<T> {
    bincode::deserialize(bytes).deserialize_context(what, std::any::type_name::<T>())
}
