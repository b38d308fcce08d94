//! Error context helpers
//!
//! Extension traits that attach the failing operation to errors.

use crate::error::{ShardKvError, ShardKvResult};

/// Attach context to bincode encode/decode failures
pub trait SerializationContext<T> {
    fn serialize_context(self, what: &str) -> ShardKvResult<T>;
    fn deserialize_context(self, what: &str, type_name: &str) -> ShardKvResult<T>;
}

impl<T> SerializationContext<T> for Result<T, bincode::Error> {
    fn serialize_context(self, what: &str) -> ShardKvResult<T> {
        self.map_err(|e| ShardKvError::Serialization {
            operation: format!("serialize {}", what),
            source: Box::new(e),
        })
    }

    fn deserialize_context(self, what: &str, type_name: &str) -> ShardKvResult<T> {
        self.map_err(|e| ShardKvError::Serialization {
            operation: format!("deserialize {} as {}", what, type_name),
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_context_names_type() {
        let result: Result<u64, bincode::Error> = bincode::deserialize(&[1u8]);
        let err = result.deserialize_context("entry", "u64").unwrap_err();
        assert!(err.to_string().contains("deserialize entry as u64"));
    }
}
