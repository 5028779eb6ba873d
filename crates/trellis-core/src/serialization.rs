//! Bincode serialization helpers
//!
//! Every Trellis wire payload goes through these two functions so encoding
//! options stay identical on both sides of a link.

use crate::{Result, TrellisError};
use serde::{de::DeserializeOwned, Serialize};

/// Serialize any serde-compatible value to bytes
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| TrellisError::serialization(format!("Failed to encode: {e}")))
}

/// Deserialize bytes produced by [`to_vec`]
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| TrellisError::serialization(format!("Failed to decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProcId;

    #[test]
    fn truncated_input_is_a_serialization_error() {
        let bytes = to_vec(&vec![ProcId::new("job", 1), ProcId::wildcard("job")])
            .unwrap_or_default();
        assert!(!bytes.is_empty());
        let result: Result<Vec<ProcId>> = from_slice(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(TrellisError::Serialization { .. })));
    }
}
