//! Transport implementations
//!
//! A [`Transport`] carries command strings to one device and brings replies
//! back. The driver core only ever talks to this trait; concrete
//! implementations handle the protocol details:
//!
//! - [`serial::SerialTransport`]: RS-232 / USB-serial ports (feature `instrument_serial`)
//! - [`simulated::SimulatedTransport`]: wraps a [`Simulator`](simulated::Simulator)
//! - [`mock::MockDevice`]: a scripted, recording simulator for tests
//!
//! Transports are synchronous. Drivers serialize access with their own lock and
//! move I/O onto blocking worker threads for concurrent calls.

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod simulated;

pub use mock::{MockDevice, MockEvent, MockLog};
#[cfg(feature = "instrument_serial")]
pub use serial::SerialTransport;
pub use simulated::{simulator_fn, SimulatedTransport, Simulator, SimulatorFactory};

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Byte-level channel to one device.
pub trait Transport: Send {
    /// Send a command and read one reply (terminator stripped).
    fn query(&mut self, command: &str) -> Result<String, TransportError>;

    /// Send a command without reading anything back.
    fn write(&mut self, command: &str) -> Result<(), TransportError>;

    /// Discard anything buffered in either direction.
    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Release the channel. Closing twice is a no-op.
    fn close(&mut self) -> Result<(), TransportError>;

    /// Human readable description for logs.
    fn describe(&self) -> String;
}

/// Opens a real transport for a device id.
pub type TransportFactory =
    Arc<dyn Fn(&str, &TransportConfig) -> anyhow::Result<Box<dyn Transport>> + Send + Sync>;

/// The factory used when a driver class does not set its own.
pub fn default_factory() -> TransportFactory {
    Arc::new(open_default)
}

#[cfg(feature = "instrument_serial")]
fn open_default(id: &str, config: &TransportConfig) -> anyhow::Result<Box<dyn Transport>> {
    Ok(Box::new(SerialTransport::open(id, config)?))
}

#[cfg(not(feature = "instrument_serial"))]
fn open_default(_id: &str, _config: &TransportConfig) -> anyhow::Result<Box<dyn Transport>> {
    anyhow::bail!("Serial support not enabled. Rebuild with --features instrument_serial")
}

/// Connection parameters shared by all transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Baud rate for serial links
    pub baud_rate: u32,
    /// Terminator expected at the end of each reply
    pub read_terminator: String,
    /// Terminator appended to each command
    pub write_terminator: String,
    /// Read timeout in milliseconds
    pub timeout_ms: u64,
    /// Pause after opening, before the first flush
    pub wait_after_connect_ms: u64,
    /// Separator between the wire prefix and each argument token
    pub command_separator: String,
    /// Flush the channel before every command
    pub flush_before_command: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            baud_rate: 57600,
            read_terminator: "\n".to_string(),
            write_terminator: "\n".to_string(),
            timeout_ms: 2000,
            wait_after_connect_ms: 0,
            command_separator: " ".to_string(),
            flush_before_command: true,
        }
    }
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Set baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set both terminators
    pub fn with_terminators(mut self, read: impl Into<String>, write: impl Into<String>) -> Self {
        self.read_terminator = read.into();
        self.write_terminator = write.into();
        self
    }

    /// Set the separator between prefix and arguments
    pub fn with_command_separator(mut self, separator: impl Into<String>) -> Self {
        self.command_separator = separator.into();
        self
    }

    pub fn with_flush_before_command(mut self, flush: bool) -> Self {
        self.flush_before_command = flush;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.baud_rate, 57600);
        assert_eq!(config.command_separator, " ");
        assert_eq!(config.timeout(), Duration::from_secs(2));
        assert!(config.flush_before_command);
    }

    #[test]
    fn test_config_builder() {
        let config = TransportConfig::default()
            .with_baud_rate(9600)
            .with_timeout(Duration::from_millis(500))
            .with_terminators("\r\n", "\r")
            .with_command_separator(",");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.timeout_ms, 500);
        assert_eq!(config.read_terminator, "\r\n");
        assert_eq!(config.write_terminator, "\r");
        assert_eq!(config.command_separator, ",");
    }

    #[test]
    fn test_partial_config_deserializes() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"baud_rate": 115200, "command_separator": ","}"#).unwrap();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.read_terminator, "\n");
    }

    #[cfg(not(feature = "instrument_serial"))]
    #[test]
    fn test_default_factory_without_serial() {
        let factory = default_factory();
        let err = factory("/dev/ttyUSB0", &TransportConfig::default()).err().unwrap();
        assert!(err.to_string().contains("instrument_serial"));
    }
}
