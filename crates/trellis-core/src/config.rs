//! Core configuration trait for Trellis components
//!
//! Components describe their settings as a serde struct with sensible
//! defaults, loadable from TOML and overridable from `TRELLIS_*` environment
//! variables.

use crate::{Result, TrellisError};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;

/// Prefix shared by every environment override
pub const ENV_PREFIX: &str = "TRELLIS_";

/// Core trait for Trellis configuration types
pub trait TrellisConfig: Clone + Default + DeserializeOwned + Send + Sync + 'static {
    /// Parse configuration from TOML text. Missing keys keep their defaults
    /// when the type uses `#[serde(default)]`.
    fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrellisError::config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `TRELLIS_*` environment overrides
    fn merge_with_env(&mut self) -> Result<()>;

    /// Validate the configuration
    fn validate(&self) -> Result<()>;
}

/// Read and parse `TRELLIS_<key>` if it is set
pub fn env_override<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{ENV_PREFIX}{key}");
    match std::env::var(&name) {
        Ok(raw) => {
            tracing::debug!(variable = %name, value = %raw, "config override from environment");
            raw.trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| TrellisError::config(format!("{name}={raw}: {e}")))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(TrellisError::config(format!("{name}: {e}"))),
    }
}
