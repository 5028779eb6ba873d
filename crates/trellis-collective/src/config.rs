//! Collective engine configuration.

use serde::{Deserialize, Serialize};
use trellis_core::config::env_override;
use trellis_core::{Result, TrellisConfig, TrellisError};

/// Payload compression for broadcasts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Whether broadcasts try to compress their payload at all
    pub enabled: bool,
    /// Payloads shorter than this many bytes are sent as-is
    pub threshold: usize,
    /// zlib level, 0 through 9
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 4096,
            level: 6,
        }
    }
}

/// Settings for one daemon's collective engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectiveConfig {
    /// First context id handed out by the root; later ids count down from it
    pub initial_context_id: u64,
    /// Broadcast payload compression
    pub compression: CompressionConfig,
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            initial_context_id: u64::MAX,
            compression: CompressionConfig::default(),
        }
    }
}

impl TrellisConfig for CollectiveConfig {
    fn merge_with_env(&mut self) -> Result<()> {
        if let Some(id) = env_override("INITIAL_CONTEXT_ID")? {
            self.initial_context_id = id;
        }
        if let Some(enabled) = env_override("COMPRESSION_ENABLED")? {
            self.compression.enabled = enabled;
        }
        if let Some(threshold) = env_override("COMPRESSION_THRESHOLD")? {
            self.compression.threshold = threshold;
        }
        if let Some(level) = env_override("COMPRESSION_LEVEL")? {
            self.compression.level = level;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.initial_context_id == 0 {
            return Err(TrellisError::config(
                "initial_context_id must leave room to count down",
            ));
        }
        if self.compression.level > 9 {
            return Err(TrellisError::config(format!(
                "compression level {} is outside 0..=9",
                self.compression.level
            )));
        }
        Ok(())
    }
}
