//! Custom error types for the driver engine.
//!
//! This module defines the primary error type, `DriverError`, returned by every
//! synthesized method and by driver construction. Using the `thiserror` crate, it
//! provides one place where the failure modes of a device call are spelled out.
//!
//! ## Error Hierarchy
//!
//! - **`Argument`**: a bad or missing argument. Raised while binding, before any
//!   transport I/O, so it is always the caller's bug and always recoverable.
//! - **`Connection`**: the transport could not be opened, or the driver's health
//!   check failed. Fatal to construction.
//! - **`Device`**: something went wrong once the command reached the wire. The
//!   attached [`DeviceFault`] says whether the transport faulted (the channel was
//!   flushed before the error was returned), the response validator rejected the
//!   reply, or the response parser could not make sense of it.
//! - **`Configuration`**: a malformed descriptor at registration time, or
//!   simulation requested for a class without a simulator.
//! - **`State`**: a method was called after the driver was closed.
//!
//! Transport-level faults have their own type, [`TransportError`], produced by
//! [`Transport`](crate::transport::Transport) implementations. The dispatch
//! pipeline wraps them into `DriverError::Device`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Errors surfaced by drivers and synthesized methods.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Invalid argument '{argument}' for '{method}': {reason}")]
    Argument {
        method: String,
        argument: String,
        reason: String,
    },

    #[error("Could not connect to device '{id}': {reason:#}")]
    Connection { id: String, reason: anyhow::Error },

    #[error("Device error during '{method}': {fault}")]
    Device { method: String, fault: DeviceFault },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Driver for '{0}' is closed")]
    State(String),

    #[error("No method named '{0}' is registered")]
    UnknownMethod(String),

    #[error("Call to '{0}' was cancelled before it reached the device")]
    Cancelled(String),

    #[error("Concurrent calls need a Tokio runtime: {0}")]
    Runtime(String),
}

impl DriverError {
    pub(crate) fn argument(
        method: impl Into<String>,
        argument: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Argument {
            method: method.into(),
            argument: argument.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable name of the error kind, used on the controller wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Argument { .. } => "argument",
            Self::Connection { .. } => "connection",
            Self::Device { .. } => "device",
            Self::Configuration(_) => "configuration",
            Self::State(_) => "state",
            Self::UnknownMethod(_) => "unknown_method",
            Self::Cancelled(_) => "cancelled",
            Self::Runtime(_) => "runtime",
        }
    }

    /// True when the error came from a transport fault (and the channel was flushed).
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            Self::Device {
                fault: DeviceFault::Transport(_),
                ..
            }
        )
    }
}

/// What went wrong once a command was dispatched to the device.
#[derive(Error, Debug)]
pub enum DeviceFault {
    #[error("transport fault: {0}")]
    Transport(#[from] TransportError),

    #[error("response {response:?} rejected: {reason:#}")]
    Rejected {
        response: String,
        reason: anyhow::Error,
    },

    #[error("response {response:?} could not be parsed: {reason:#}")]
    Unparseable {
        response: String,
        reason: anyhow::Error,
    },
}

/// Faults raised by a transport while talking to the device.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error on '{resource}': {source}")]
    Io {
        resource: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {0:?} waiting for a response")]
    Timeout(Duration),

    #[error("Response is not valid UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("Transport is closed")]
    Closed,

    #[error("Simulator fault: {0:#}")]
    Simulator(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriverError::argument("set_voltage", "voltage", "15 is above 10");
        assert_eq!(
            err.to_string(),
            "Invalid argument 'voltage' for 'set_voltage': 15 is above 10"
        );
        assert_eq!(err.kind(), "argument");
    }

    #[test]
    fn test_device_fault_from_transport() {
        let err = DriverError::Device {
            method: "get_identity".into(),
            fault: TransportError::Timeout(Duration::from_millis(250)).into(),
        };
        assert!(err.is_transport_fault());
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_rejected_response_is_not_transport_fault() {
        let err = DriverError::Device {
            method: "get_status".into(),
            fault: DeviceFault::Rejected {
                response: "ERR 3".into(),
                reason: anyhow::anyhow!("device reported error 3"),
            },
        };
        assert!(!err.is_transport_fault());
        assert!(err.to_string().contains("ERR 3"));
    }
}
