//! Mock device for testing without physical hardware.
//!
//! [`MockDevice`] is a [`Simulator`] that answers from a table of scripted
//! replies and records everything it sees into a [`MockLog`]. The log is shared,
//! so a test can keep a handle to it after the device has been moved into a
//! driver.
//!
//! # Example
//!
//! ```
//! use generic_scpi_driver::transport::{MockDevice, Simulator};
//!
//! let mut device = MockDevice::new().respond("*IDN", "Simulator device");
//! let log = device.log();
//! assert_eq!(device.query("*IDN").unwrap(), "Simulator device");
//! assert_eq!(log.commands(), vec!["*IDN".to_string()]);
//! ```

use super::simulated::{Simulator, SimulatorFactory};
use anyhow::bail;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Something the mock device observed.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    /// A query arrived
    Received(String),
    /// The reply to a query was handed back
    Replied(String),
    /// A command arrived whose reply is not read
    Written(String),
    Flushed,
    Closed,
}

/// Shared record of [`MockEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    events: Arc<Mutex<Vec<MockEvent>>>,
}

impl MockLog {
    fn push(&self, event: MockEvent) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.events.lock().clone()
    }

    /// Every command received, queries and writes, in order.
    pub fn commands(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                MockEvent::Received(c) | MockEvent::Written(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn last_command(&self) -> Option<String> {
        self.commands().pop()
    }

    pub fn flush_count(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Flushed))
    }

    pub fn close_count(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Closed))
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn count(&self, pred: impl Fn(&MockEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

/// Scripted, recording simulator.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    responses: HashMap<String, String>,
    fallback: String,
    failing: HashSet<String>,
    fail_flush: bool,
    delay: Duration,
    log: MockLog,
}

impl MockDevice {
    /// A device that answers every query with an empty string.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to `command` with `response`.
    pub fn respond(mut self, command: impl Into<String>, response: impl Into<String>) -> Self {
        self.responses.insert(command.into(), response.into());
        self
    }

    /// Reply to unscripted queries with `response`.
    pub fn fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = response.into();
        self
    }

    /// Fail `command` as if the link dropped.
    pub fn fail_on(mut self, command: impl Into<String>) -> Self {
        self.failing.insert(command.into());
        self
    }

    /// Make flushes fail too.
    pub fn fail_flush(mut self, fail: bool) -> Self {
        self.fail_flush = fail;
        self
    }

    /// Hold every exchange for `delay` between receiving and replying.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Handle to the event log, shared with every clone of this device.
    pub fn log(&self) -> MockLog {
        self.log.clone()
    }

    /// Factory producing clones of this device (all sharing one log).
    pub fn factory(self) -> SimulatorFactory {
        Arc::new(move || Box::new(self.clone()) as Box<dyn Simulator>)
    }

    fn reply_for(&self, command: &str) -> anyhow::Result<String> {
        if self.failing.contains(command) {
            bail!("mock link failure on '{command}'");
        }
        Ok(self
            .responses
            .get(command)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

impl Simulator for MockDevice {
    fn query(&mut self, command: &str) -> anyhow::Result<String> {
        self.log.push(MockEvent::Received(command.to_string()));
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let reply = self.reply_for(command)?;
        self.log.push(MockEvent::Replied(command.to_string()));
        Ok(reply)
    }

    fn write(&mut self, command: &str) -> anyhow::Result<()> {
        self.log.push(MockEvent::Written(command.to_string()));
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.reply_for(command).map(drop)
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.log.push(MockEvent::Flushed);
        if self.fail_flush {
            bail!("mock flush failure");
        }
        Ok(())
    }

    fn close(&mut self) {
        self.log.push(MockEvent::Closed);
    }
}
