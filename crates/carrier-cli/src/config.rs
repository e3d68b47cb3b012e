//! Configuration file for the Carrier CLI.

use carrier_core::{CarrierConfig, EventConfig, LoggingConfig, TransferConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// CLI configuration: the node sections plus demo settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transfer configuration
    pub transfer: TransferConfig,
    /// Event sink configuration
    pub events: EventConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Demo configuration
    pub demo: DemoConfig,
}

/// Settings of the in-memory demo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Name of the sending node
    pub sender: String,
    /// Name of the receiving node
    pub receiver: String,
    /// Directory received files are written to
    pub output_dir: PathBuf,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            sender: "alice".to_string(),
            receiver: "bob".to_string(),
            output_dir: std::env::temp_dir().join("carrier-demo"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Render as TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Node configuration
    #[must_use]
    pub fn carrier(&self) -> CarrierConfig {
        CarrierConfig {
            transfer: self.transfer.clone(),
            events: self.events.clone(),
            logging: self.logging.clone(),
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if any node section is unusable or the demo peers
    /// share a name.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.carrier().validate()?;
        if self.demo.sender.is_empty() || self.demo.receiver.is_empty() {
            anyhow::bail!("demo peer names must not be empty");
        }
        if self.demo.sender == self.demo.receiver {
            anyhow::bail!("demo sender and receiver must differ");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carrier_core::PartialFilePolicy;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transfer.chunk_size, 16 * 1024);
        assert_eq!(config.demo.sender, "alice");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.demo.receiver = config.demo.sender.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carrier.toml");
        fs::write(
            &path,
            "[transfer]\nwindow_size = 2\npartial_files = \"delete\"\n\n[logging]\nlevel = \"debug\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.transfer.window_size, 2);
        assert_eq!(config.transfer.chunk_size, 16 * 1024);
        assert_eq!(config.transfer.partial_files, PartialFilePolicy::Delete);
        assert_eq!(config.carrier().logging.level, "debug");
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
