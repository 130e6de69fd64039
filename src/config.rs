use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::checksum::ChecksumAlgorithm;
use crate::core::multi::SessionOptions;
use crate::logging::LogConfig;

/// Prefix of environment variables overriding file settings. Nested keys use
/// a double underscore, e.g. `MULTIFLASH_LOG__JSON=true`.
pub const ENV_PREFIX: &str = "MULTIFLASH_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    pub json: bool,
    pub verbose: bool,
}

impl From<&LogSettings> for LogConfig {
    fn from(settings: &LogSettings) -> Self {
        LogConfig {
            json: settings.json,
            verbose: settings.verbose,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Raw disk image to write.
    pub image: PathBuf,
    /// Image files or block devices to write to.
    pub destinations: Vec<PathBuf>,
    /// Read every destination back after writing.
    pub verify: bool,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub progress_interval_ms: u64,
    /// Bytes read from the image per chunk.
    pub chunk_size: usize,
    /// Chunks queued per destination.
    pub stream_buffer: usize,
    pub sync_on_finish: bool,
    /// Write to in-memory destinations instead of the configured paths.
    pub simulation: bool,
    pub log: LogSettings,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            image: PathBuf::new(),
            destinations: Vec::new(),
            verify: true,
            checksum_algorithm: ChecksumAlgorithm::default(),
            progress_interval_ms: 1000,
            chunk_size: 1024 * 1024,
            stream_buffer: 16,
            sync_on_finish: true,
            simulation: false,
            log: LogSettings::default(),
        }
    }
}

impl FlashConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            stream_buffer: self.stream_buffer,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("image must be set".to_string()));
        }
        if self.destinations.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one destination is required".to_string(),
            ));
        }
        if self.progress_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "progress_interval_ms cannot be 0".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size cannot be 0".to_string()));
        }
        if self.stream_buffer == 0 {
            return Err(ConfigError::Invalid("stream_buffer cannot be 0".to_string()));
        }
        Ok(())
    }
}

/// Load configuration from defaults, then `path` if it exists, then the
/// environment.
pub fn load_config(path: &Path) -> Result<FlashConfig, ConfigError> {
    Figment::from(Serialized::defaults(FlashConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Load configuration from a TOML string on top of the defaults.
pub fn load_config_from_str(toml_str: &str) -> Result<FlashConfig, ConfigError> {
    Figment::from(Serialized::defaults(FlashConfig::default()))
        .merge(Toml::string(toml_str))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))
}
