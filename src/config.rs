//! Controller configuration using Figment
//!
//! A controller process is configured from, in increasing priority:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables prefixed with `SCPI_`
//! 4. command-line flags (applied by the controller itself)
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore so that field names may
//! keep their own underscores:
//!
//! ```text
//! SCPI_LOG_LEVEL=debug
//! SCPI_DEVICE__ID="USB VID:PID=0403:6001"
//! SCPI_SERVER__PORT=3251
//! SCPI_TRANSPORT__BAUD_RATE=9600
//! ```
//!
//! # Example file
//!
//! ```toml
//! log_level = "info"
//!
//! [device]
//! id = "/dev/ttyUSB0"
//! simulation = false
//!
//! [server]
//! bind = "0.0.0.0"
//! port = 3251
//!
//! [transport]
//! baud_rate = 57600
//! timeout_ms = 1000
//! ```

use crate::transport::TransportConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;

/// Prefix of environment variables read by [`ControllerConfig::load_from`].
pub const ENV_PREFIX: &str = "SCPI_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Top-level controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
    pub device: DeviceConfig,
    pub server: ServerConfig,
    /// Transport parameters passed to the driver
    pub transport: TransportConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            device: DeviceConfig::default(),
            server: ServerConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Which device to drive
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Port path or hardware id; required unless simulating
    pub id: Option<String>,
    /// Use the driver class's simulator
    pub simulation: bool,
}

/// Where the controller listens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// TCP port; `None` uses the controller's default port
    pub port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

impl ControllerConfig {
    /// Load from an optional TOML file plus `SCPI_` environment variables, then validate.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Same layering as [`load_from`](Self::load_from) but unvalidated, for
    /// callers that apply further overrides first.
    pub fn extract_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::extract_with_prefix(path, ENV_PREFIX)
    }

    pub(crate) fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self, ConfigError> {
        let config = Self::extract_with_prefix(path, prefix)?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn extract_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed(prefix).split("__"))
            .extract()
            .map_err(ConfigError::Load)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.server.bind.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid bind address '{}'",
                self.server.bind
            )));
        }

        if matches!(&self.device.id, Some(id) if id.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "device.id must not be empty".to_string(),
            ));
        }

        let transport = &self.transport;
        if transport.baud_rate == 0 {
            return Err(ConfigError::Validation(
                "transport.baud_rate must be greater than 0".to_string(),
            ));
        }
        if transport.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "transport.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if transport.command_separator.is_empty() {
            return Err(ConfigError::Validation(
                "transport.command_separator must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn toml_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_file() {
        let config = ControllerConfig::load_with_prefix(None, "SCPI_TEST_NOTHING_").unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.transport.baud_rate, 57600);
    }

    #[test]
    fn test_partial_file() {
        let file = toml_file(
            r#"
            log_level = "debug"

            [device]
            id = "/dev/ttyUSB0"

            [transport]
            baud_rate = 9600
            "#,
        );
        let config = ControllerConfig::load_with_prefix(Some(file.path()), "SCPI_TEST_PARTIAL_").unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.device.id.as_deref(), Some("/dev/ttyUSB0"));
        assert!(!config.device.simulation);
        assert_eq!(config.transport.baud_rate, 9600);
        assert_eq!(config.transport.read_terminator, "\n");
        assert_eq!(config.server.bind, "127.0.0.1");
    }

    #[test]
    fn test_env_overrides_file() {
        let file = toml_file("[server]\nport = 3000\n");
        std::env::set_var("SCPI_TEST_ENV_SERVER__PORT", "3251");
        std::env::set_var("SCPI_TEST_ENV_DEVICE__SIMULATION", "true");
        let config = ControllerConfig::load_with_prefix(Some(file.path()), "SCPI_TEST_ENV_").unwrap();
        assert_eq!(config.server.port, Some(3251));
        assert!(config.device.simulation);
    }

    #[test]
    fn test_invalid_log_level() {
        let file = toml_file("log_level = \"loud\"\n");
        let err = ControllerConfig::load_with_prefix(Some(file.path()), "SCPI_TEST_LEVEL_").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_invalid_bind_address() {
        let mut config = ControllerConfig::default();
        config.server.bind = "localhost:80".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = ControllerConfig::default();
        config.transport.timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeout_ms"));
    }

    #[test]
    fn test_malformed_toml() {
        let file = toml_file("[server\nport = ");
        let err = ControllerConfig::load_with_prefix(Some(file.path()), "SCPI_TEST_BAD_").unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
