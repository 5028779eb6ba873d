//! Broadcast payload compression (zlib)

use crate::config::CompressionConfig;
use crate::errors::{CollectiveError, CollectiveResult};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use trellis_core::Tag;

/// Upper bound of the deflate expansion ratio
const MAX_INFLATE_RATIO: usize = 1032;

/// Broadcast payload as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Whether `bytes` is zlib-compressed
    pub compressed: bool,
    /// Length of the uncompressed payload
    pub original_len: u64,
    /// Payload bytes
    pub bytes: Vec<u8>,
}

impl Payload {
    /// Uncompressed payload
    pub fn raw(bytes: Vec<u8>) -> Self {
        Self {
            compressed: false,
            original_len: bytes.len() as u64,
            bytes,
        }
    }
}

/// Packs broadcast payloads according to [`CompressionConfig`]
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    /// Compressor with the given settings
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Compress when enabled, large enough and actually smaller; otherwise
    /// keep an uncompressed copy.
    pub fn pack(&self, bytes: Vec<u8>) -> Payload {
        if !self.config.enabled || bytes.len() < self.config.threshold {
            return Payload::raw(bytes);
        }
        match self.deflate(&bytes) {
            Ok(packed) if packed.len() < bytes.len() => Payload {
                compressed: true,
                original_len: bytes.len() as u64,
                bytes: packed,
            },
            Ok(_) => Payload::raw(bytes),
            Err(err) => {
                tracing::warn!(error = %err, "payload compression failed, sending uncompressed");
                Payload::raw(bytes)
            }
        }
    }

    fn deflate(&self, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.config.level));
        encoder.write_all(bytes)?;
        encoder.finish()
    }
}

/// Recover the original bytes of a payload that arrived on `tag`
pub fn unpack(tag: Tag, payload: &Payload) -> CollectiveResult<Vec<u8>> {
    if !payload.compressed {
        return Ok(payload.bytes.clone());
    }
    // The claimed length comes off the wire; never trust it for allocation.
    let claimed = usize::try_from(payload.original_len).unwrap_or(usize::MAX);
    let mut bytes =
        Vec::with_capacity(claimed.min(payload.bytes.len().saturating_mul(MAX_INFLATE_RATIO)));
    ZlibDecoder::new(payload.bytes.as_slice())
        .take(payload.original_len.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|e| CollectiveError::malformed(tag, format!("corrupt compressed payload: {e}")))?;
    if bytes.len() as u64 != payload.original_len {
        return Err(CollectiveError::malformed(
            tag,
            format!(
                "payload inflated to {} bytes, expected {}",
                bytes.len(),
                payload.original_len
            ),
        ));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressor(threshold: usize) -> Compressor {
        Compressor::new(CompressionConfig {
            enabled: true,
            threshold,
            level: 6,
        })
    }

    #[test]
    fn small_payloads_stay_raw() {
        let payload = compressor(64).pack(vec![7; 16]);
        assert!(!payload.compressed);
        assert_eq!(payload.bytes, vec![7; 16]);
    }

    #[test]
    fn repetitive_payloads_shrink_and_inflate_back() {
        let original = vec![42u8; 10_000];
        let payload = compressor(64).pack(original.clone());
        assert!(payload.compressed);
        assert!(payload.bytes.len() < original.len());
        assert_eq!(unpack(Tag::XCAST, &payload).unwrap(), original);
    }

    #[test]
    fn disabled_compression_never_compresses() {
        let compressor = Compressor::new(CompressionConfig {
            enabled: false,
            ..CompressionConfig::default()
        });
        assert!(!compressor.pack(vec![0; 100_000]).compressed);
    }

    #[test]
    fn corrupt_payload_is_malformed() {
        let payload = Payload {
            compressed: true,
            original_len: 10,
            bytes: vec![1, 2, 3],
        };
        assert!(matches!(
            unpack(Tag::WIREUP, &payload),
            Err(CollectiveError::MalformedWire { .. })
        ));
    }

    #[test]
    fn inflated_length_must_match_the_claim() {
        let mut payload = compressor(64).pack(vec![5u8; 4_096]);
        payload.original_len = u64::MAX;
        assert!(matches!(
            unpack(Tag::XCAST, &payload),
            Err(CollectiveError::MalformedWire { .. })
        ));

        payload.original_len = 100;
        assert!(matches!(
            unpack(Tag::XCAST, &payload),
            Err(CollectiveError::MalformedWire { .. })
        ));
    }
}
