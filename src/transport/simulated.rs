//! Simulation support
//!
//! A [`Simulator`] stands in for the real device. Any type that can answer
//! `query(command) -> reply` qualifies, including plain closures. A driver
//! class registers a [`SimulatorFactory`]; constructing a driver in simulation
//! mode calls the factory and wraps the simulator in a [`SimulatedTransport`]
//! instead of opening hardware.

use super::Transport;
use crate::error::TransportError;
use std::sync::Arc;

/// Substitute for a real device.
pub trait Simulator: Send {
    /// Answer one command.
    fn query(&mut self, command: &str) -> anyhow::Result<String>;

    /// Receive a command whose reply is not read. Forwards to `query` and drops the reply.
    fn write(&mut self, command: &str) -> anyhow::Result<()> {
        self.query(command).map(drop)
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

impl<F> Simulator for F
where
    F: FnMut(&str) -> anyhow::Result<String> + Send,
{
    fn query(&mut self, command: &str) -> anyhow::Result<String> {
        self(command)
    }
}

/// Pin a closure to the simulator signature.
///
/// Closures passed straight to a generic `Simulator` bound cannot have their
/// argument and error types inferred; routing them through here fixes both.
pub fn simulator_fn<F>(f: F) -> F
where
    F: FnMut(&str) -> anyhow::Result<String> + Send,
{
    f
}

/// Creates a fresh simulator for each simulated driver instance.
pub type SimulatorFactory = Arc<dyn Fn() -> Box<dyn Simulator> + Send + Sync>;

/// Transport backed by a [`Simulator`].
pub struct SimulatedTransport {
    simulator: Box<dyn Simulator>,
    closed: bool,
}

impl SimulatedTransport {
    pub fn new(simulator: Box<dyn Simulator>) -> Self {
        Self {
            simulator,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Transport for SimulatedTransport {
    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.ensure_open()?;
        self.simulator
            .query(command)
            .map_err(TransportError::Simulator)
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.simulator
            .write(command)
            .map_err(TransportError::Simulator)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.simulator.flush().map_err(TransportError::Simulator)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.simulator.close();
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "SimulatedTransport".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulated<F>(f: F) -> SimulatedTransport
    where
        F: FnMut(&str) -> anyhow::Result<String> + Send + 'static,
    {
        SimulatedTransport::new(Box::new(f))
    }

    #[test]
    fn test_closure_simulator() {
        let mut transport = simulated(|cmd| {
            Ok(if cmd == "*IDN" {
                "Simulator device".to_string()
            } else {
                String::new()
            })
        });
        assert_eq!(transport.query("*IDN").unwrap(), "Simulator device");
    }

    #[test]
    fn test_closed_transport_rejects_io() {
        let mut transport = simulated(|_| Ok("x".to_string()));
        transport.close().unwrap();
        transport.close().unwrap();
        assert!(matches!(transport.query("A"), Err(TransportError::Closed)));
        assert!(matches!(transport.flush(), Err(TransportError::Closed)));
    }

    #[test]
    fn test_simulator_error_is_transport_fault() {
        let mut transport = simulated(|_| Err(anyhow::anyhow!("link down")));
        let err = transport.query("A").unwrap_err();
        assert!(err.to_string().contains("link down"));
    }
}
