//! Carrier node configuration

use crate::error::{CarrierError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Carrier node configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarrierConfig {
    /// Transfer configuration
    pub transfer: TransferConfig,

    /// Event sink configuration
    pub events: EventConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl CarrierConfig {
    /// Check every section for unusable values
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.transfer.validate()?;
        self.events.validate()
    }
}

/// What to do with a partially received file when the transfer stops early
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFilePolicy {
    /// Leave the partial file on disk
    #[default]
    Keep,
    /// Delete the partial file
    Delete,
}

/// Transfer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per chunk
    pub chunk_size: usize,

    /// In-flight unacknowledged chunks per transfer
    pub window_size: usize,

    /// Minimum spacing between progress events, in milliseconds
    pub progress_interval_ms: u64,

    /// Also emit progress every N chunks (0 disables)
    pub progress_stride: u32,

    /// Terminal descriptors retained for diagnostics
    pub history_capacity: usize,

    /// Receive-side handling of partial files on cancel or abort
    pub partial_files: PartialFilePolicy,
}

impl TransferConfig {
    /// Progress interval as a `Duration`
    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(CarrierError::invalid_config("transfer.chunk_size must be > 0"));
        }
        if self.chunk_size > u32::MAX as usize {
            return Err(CarrierError::invalid_config(
                "transfer.chunk_size must fit in 32 bits",
            ));
        }
        if self.window_size == 0 {
            return Err(CarrierError::invalid_config("transfer.window_size must be > 0"));
        }
        if self.window_size > Semaphore::MAX_PERMITS {
            return Err(CarrierError::InvalidConfig(Cow::Owned(format!(
                "transfer.window_size must be at most {}",
                Semaphore::MAX_PERMITS
            ))));
        }
        if self.history_capacity == 0 {
            return Err(CarrierError::invalid_config(
                "transfer.history_capacity must be > 0",
            ));
        }
        Ok(())
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: carrier_files::DEFAULT_CHUNK_SIZE, // 16 KiB
            window_size: 8,
            progress_interval_ms: 250,
            progress_stride: 0,
            history_capacity: 256,
            partial_files: PartialFilePolicy::Keep,
        }
    }
}

/// Event sink configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Queue cap; `None` is unbounded
    pub capacity: Option<usize>,
}

impl EventConfig {
    fn validate(&self) -> Result<()> {
        if self.capacity == Some(0) {
            return Err(CarrierError::invalid_config("events.capacity must be > 0"));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (tracing `EnvFilter` syntax)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CarrierConfig::default();
        assert_eq!(config.transfer.chunk_size, 16 * 1024);
        assert_eq!(config.transfer.history_capacity, 256);
        assert_eq!(config.transfer.partial_files, PartialFilePolicy::Keep);
        assert!(config.events.capacity.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = CarrierConfig::default();
        config.transfer.window_size = 0;
        assert!(matches!(
            config.validate(),
            Err(CarrierError::InvalidConfig(_))
        ));

        let mut config = CarrierConfig::default();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = CarrierConfig::default();
        config.events.capacity = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_caps_window() {
        let mut config = CarrierConfig::default();
        config.transfer.window_size = usize::MAX;
        assert!(matches!(
            config.validate(),
            Err(CarrierError::InvalidConfig(_))
        ));

        config.transfer.window_size = Semaphore::MAX_PERMITS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_deserialize() {
        let json = r#"{ "transfer": { "chunk_size": 16, "partial_files": "delete" } }"#;
        let config: CarrierConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.transfer.chunk_size, 16);
        assert_eq!(config.transfer.window_size, 8);
        assert_eq!(config.transfer.partial_files, PartialFilePolicy::Delete);
        assert_eq!(config.logging.level, "info");
    }
}
