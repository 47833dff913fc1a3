//! Serial transport for RS-232 / USB-serial instruments
//!
//! Wraps the `serialport` crate. A device may be addressed by its port path
//! (`/dev/ttyUSB0`, `COM3`) or, more robustly, by a fragment of its hardware
//! id such as `USB VID:PID=0403:6001 SER=A6003SX4A`, which stays the same when
//! the operating system renumbers ports.

use super::{Transport, TransportConfig};
use crate::error::TransportError;
use anyhow::{bail, Context, Result};
use regex::Regex;
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Internal poll interval for reads; the overall deadline comes from the config.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Serial transport for one instrument
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 57600)
    baud_rate: u32,

    /// Overall deadline for one reply
    timeout: Duration,

    /// Terminator appended to commands
    write_terminator: String,

    /// Terminator that ends a reply
    read_terminator: String,

    /// The open port; `None` once closed
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Resolve `id` to a port and open it.
    ///
    /// # Errors
    /// Fails if `id` matches several ports or the port cannot be opened.
    pub fn open(id: &str, config: &TransportConfig) -> Result<Self> {
        let port_name = resolve_port(id)?;

        let port = serialport::new(&port_name, config.baud_rate)
            .timeout(POLL_INTERVAL)
            .open()
            .with_context(|| {
                format!(
                    "Failed to open serial port '{}' at {} baud",
                    port_name, config.baud_rate
                )
            })?;

        if config.wait_after_connect_ms > 0 {
            std::thread::sleep(Duration::from_millis(config.wait_after_connect_ms));
        }

        debug!(
            port = %port_name,
            baud_rate = config.baud_rate,
            write_terminator = ?config.write_terminator,
            read_terminator = ?config.read_terminator,
            "Serial port opened"
        );

        Ok(Self {
            port_name,
            baud_rate: config.baud_rate,
            timeout: config.timeout(),
            write_terminator: config.write_terminator.clone(),
            read_terminator: config.read_terminator.clone(),
            port: Some(port),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn io_error(&self, source: io::Error) -> TransportError {
        TransportError::Io {
            resource: self.port_name.clone(),
            source,
        }
    }

    fn read_reply(&mut self) -> Result<String, TransportError> {
        let terminator = self.read_terminator.as_bytes().to_vec();
        let deadline = Instant::now() + self.timeout;
        let mut reply = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            if let Some(end) = reply_end(&reply, &terminator) {
                if end + terminator.len() < reply.len() {
                    debug!(
                        port = %self.port_name,
                        discarded = reply.len() - end - terminator.len(),
                        "Dropping bytes read past the terminator"
                    );
                }
                reply.truncate(end);
                break;
            }
            if Instant::now() >= deadline {
                if terminator.is_empty() && !reply.is_empty() {
                    break;
                }
                return Err(TransportError::Timeout(self.timeout));
            }

            let port = self.port.as_mut().ok_or(TransportError::Closed)?;
            match port.read(&mut chunk) {
                Ok(n) => reply.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    // Without a terminator, a quiet line after data ends the reply.
                    if terminator.is_empty() && !reply.is_empty() {
                        break;
                    }
                }
                Err(e) => return Err(self.io_error(e)),
            }
        }

        let text = String::from_utf8(reply)?;
        Ok(text.trim_end_matches('\r').to_string())
    }
}

impl Transport for SerialTransport {
    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.write(command)?;
        self.read_reply()
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        let data = format!("{}{}", command, self.write_terminator);
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        let result = port.write_all(data.as_bytes()).and_then(|_| port.flush());
        result.map_err(|e| self.io_error(e))
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        let result = port.clear(ClearBuffer::All);
        result.map_err(|e| self.io_error(e.into()))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "Serial port closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("SerialTransport({} @ {} baud)", self.port_name, self.baud_rate)
    }
}

/// One enumerated serial port, reduced to the strings we match against.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PortCandidate {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) hwid: String,
}

/// Offset of the first terminator in `buf`, if a complete reply has arrived.
fn reply_end(buf: &[u8], terminator: &[u8]) -> Option<usize> {
    if terminator.is_empty() {
        return None;
    }
    buf.windows(terminator.len())
        .position(|window| window == terminator)
}

fn available_candidates() -> Vec<PortCandidate> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("Could not enumerate serial ports: {}", e);
            return Vec::new();
        }
    };

    ports
        .into_iter()
        .map(|info| {
            let (description, hwid) = match &info.port_type {
                SerialPortType::UsbPort(usb) => {
                    let mut hwid = format!("USB VID:PID={:04X}:{:04X}", usb.vid, usb.pid);
                    if let Some(serial) = &usb.serial_number {
                        hwid.push_str(&format!(" SER={serial}"));
                    }
                    (usb.product.clone().unwrap_or_default(), hwid)
                }
                _ => (String::new(), String::new()),
            };
            PortCandidate {
                name: info.port_name,
                description,
                hwid,
            }
        })
        .collect()
}

/// Find the port for a device id among the ports present on this machine.
pub fn resolve_port(id: &str) -> Result<String> {
    select_port(id, &available_candidates())
}

pub(crate) fn select_port(id: &str, candidates: &[PortCandidate]) -> Result<String> {
    let pattern = Regex::new(&format!("(?i){}", regex::escape(id)))
        .with_context(|| format!("Invalid device id '{id}'"))?;

    let matches: Vec<&PortCandidate> = candidates
        .iter()
        .filter(|c| {
            pattern.is_match(&c.name) || pattern.is_match(&c.description) || pattern.is_match(&c.hwid)
        })
        .collect();

    match matches.as_slice() {
        [] => {
            warn!(id, "No enumerated serial port matches; opening the id verbatim");
            Ok(id.to_string())
        }
        [only] => {
            if only.name.eq_ignore_ascii_case(id) && !only.hwid.is_empty() {
                warn!(
                    "Opened device by port name: it would be more robust to use the hardware id. For \"{}\", that's \"{}\"",
                    id, only.hwid
                );
            }
            debug!(id, port = %only.name, "Resolved device");
            Ok(only.name.clone())
        }
        many => bail!(
            "Multiple serial ports match '{}': {}",
            id,
            many.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ")
        ),
    }
}
