//! Dispatch pipeline
//!
//! Every call of a synthesized method runs through the same stages once its
//! arguments are bound and the command string is built:
//!
//! 1. **Lock** ([`with_lock`]): take the driver's re-entrant lock for the
//!    whole exchange. The guard is scoped, so it is released on every exit path.
//! 2. **Recovery** ([`with_recovery`]): run the transport exchange; if the
//!    transport faults, flush the channel once and hand back the original fault.
//!    A failing flush is logged and otherwise ignored.
//! 3. **Transaction** ([`transact`]): optional pre-command flush, then either a
//!    write (suppressed responses are never read) or a query.
//! 4. **Decode** ([`decode`]): run the response validator and the response
//!    parser, each on the raw reply.
//!
//! The link (the transport) lives in a `RefCell` inside the lock. It is only
//! borrowed for the transport exchange itself; validators and parsers run with
//! the lock held but the cell released. Lifecycle state sits beside the lock in
//! its own mutex, so it can be read at any time, including mid-exchange.

use crate::driver::DriverState;
use crate::error::{DeviceFault, DriverError, DriverResult, TransportError};
use crate::synth::Method;
use crate::transport::Transport;
use crate::value::Value;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::{RefCell, RefMut};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Transport of one driver.
pub(crate) struct Link {
    pub(crate) transport: Option<Box<dyn Transport>>,
}

impl Link {
    pub(crate) fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
        }
    }

    /// Close the transport if it is still open. Safe to call repeatedly.
    pub(crate) fn shutdown(&mut self, device: &str) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                warn!(device, "Error while closing {}: {}", transport.describe(), e);
            }
        }
    }
}

pub(crate) type LinkLock = ReentrantMutex<RefCell<Link>>;

/// Lifecycle state. Never held across transport I/O or user callbacks.
pub(crate) type StateCell = Mutex<DriverState>;

/// One fully encoded call, ready for the wire.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub(crate) method: Arc<Method>,
    pub(crate) command: String,
    pub(crate) flush_first: bool,
}

/// Lock stage.
pub(crate) fn with_lock<R>(lock: &LinkLock, stage: impl FnOnce(&RefCell<Link>) -> R) -> R {
    let guard = lock.lock();
    stage(&guard)
}

/// Mutable access to the link, failing instead of panicking when this thread
/// already holds it (a transport or simulator calling back into its own driver).
pub(crate) fn borrow_link<'a>(link: &'a RefCell<Link>, device: &str) -> DriverResult<RefMut<'a, Link>> {
    link.try_borrow_mut().map_err(|_| {
        DriverError::State(format!("{device} (re-entered during a transport exchange)"))
    })
}

/// Recovery stage.
pub(crate) fn with_recovery<T>(
    device: &str,
    transport: &mut dyn Transport,
    exchange: impl FnOnce(&mut dyn Transport) -> Result<T, TransportError>,
) -> Result<T, TransportError> {
    let result = exchange(transport);
    if let Err(fault) = &result {
        debug!(device, "Transport fault ({}); flushing before reporting", fault);
        if let Err(flush_error) = transport.flush() {
            warn!(device, "Flush after transport fault also failed: {}", flush_error);
        }
    }
    result
}

/// Transaction stage. Returns `None` when no reply is read.
pub(crate) fn transact(
    transport: &mut dyn Transport,
    request: &Request,
) -> Result<Option<String>, TransportError> {
    if request.flush_first {
        transport.flush()?;
    }
    if request.method.parser().expects_response() {
        transport.query(&request.command).map(Some)
    } else {
        transport.write(&request.command).map(|()| None)
    }
}

/// Decode stage: validator and parser both see the raw reply.
pub(crate) fn decode(method: &Method, raw: Option<String>) -> DriverResult<Value> {
    let Some(raw) = raw else {
        return Ok(Value::None);
    };

    if let Some(validator) = &method.descriptor().response_validator {
        validator(&raw).map_err(|reason| DriverError::Device {
            method: method.name().to_string(),
            fault: DeviceFault::Rejected {
                response: raw.clone(),
                reason,
            },
        })?;
    }

    method.parser().parse(&raw).map_err(|reason| DriverError::Device {
        method: method.name().to_string(),
        fault: DeviceFault::Unparseable {
            response: raw,
            reason,
        },
    })
}

/// Everything after the lock stage: state check, exchange with recovery, decode.
pub(crate) fn run_locked(
    state: &StateCell,
    link: &RefCell<Link>,
    device: &str,
    request: &Request,
) -> DriverResult<Value> {
    let name = request.method.name();
    let raw = {
        if !state.lock().accepts_calls() {
            return Err(DriverError::State(device.to_string()));
        }
        let mut link = borrow_link(link, device)?;
        let transport = link
            .transport
            .as_deref_mut()
            .ok_or_else(|| DriverError::State(device.to_string()))?;

        debug!(device, method = name, command = %request.command, "Sending command");
        with_recovery(device, transport, |t| transact(t, request)).map_err(|fault| {
            DriverError::Device {
                method: name.to_string(),
                fault: DeviceFault::Transport(fault),
            }
        })?
    };

    if let Some(raw) = &raw {
        trace!(device, method = name, response = %raw, "Received response");
    }
    decode(&request.method, raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Arg, CommandDescriptor, ResponseParser};
    use crate::transport::{MockDevice, MockEvent, SimulatedTransport};

    fn request(descriptor: CommandDescriptor, command: &str, flush_first: bool) -> Request {
        Request {
            method: Arc::new(Method::synthesize(descriptor).unwrap()),
            command: command.to_string(),
            flush_first,
        }
    }

    fn link(device: MockDevice) -> RefCell<Link> {
        RefCell::new(Link::new(Box::new(SimulatedTransport::new(Box::new(
            device,
        )))))
    }

    fn ready() -> StateCell {
        Mutex::new(DriverState::Ready)
    }

    #[test]
    fn test_query_round_trip() {
        let device = MockDevice::new().respond("*IDN", "Simulator device");
        let log = device.log();
        let req = request(CommandDescriptor::new("get_identity", "*IDN"), "*IDN", true);
        let value = run_locked(&ready(), &link(device), "dev", &req).unwrap();
        assert_eq!(value, Value::Str("Simulator device".into()));
        assert_eq!(
            log.events(),
            vec![
                MockEvent::Flushed,
                MockEvent::Received("*IDN".into()),
                MockEvent::Replied("*IDN".into()),
            ]
        );
    }

    #[test]
    fn test_suppressed_never_reads() {
        let device = MockDevice::new().fallback("unexpected");
        let log = device.log();
        let req = request(
            CommandDescriptor::new("reset", "*RST").parser(ResponseParser::Suppressed),
            "*RST",
            false,
        );
        assert_eq!(run_locked(&ready(), &link(device), "dev", &req).unwrap(), Value::None);
        assert_eq!(log.events(), vec![MockEvent::Written("*RST".into())]);
    }

    #[test]
    fn test_validator_and_parser_see_raw_reply() {
        let req = request(
            CommandDescriptor::new("get_current", "CURR?")
                .parser(ResponseParser::float())
                .response_validator(|raw| {
                    anyhow::ensure!(raw == "0.25", "unexpected raw reply {raw}");
                    Ok(())
                }),
            "CURR?",
            false,
        );
        let device = MockDevice::new().respond("CURR?", "0.25");
        assert_eq!(run_locked(&ready(), &link(device), "dev", &req).unwrap(), Value::Float(0.25));
    }

    #[test]
    fn test_rejected_reply_skips_parser() {
        let req = request(
            CommandDescriptor::new("get_mode", "MODE?")
                .arg(Arg::new("a"))
                .parser(ResponseParser::custom(|_| panic!("parser must not run")))
                .response_validator(|raw| {
                    anyhow::ensure!(raw != "ERR", "device reported an error");
                    Ok(())
                }),
            "MODE? x",
            false,
        );
        let device = MockDevice::new().fallback("ERR");
        let err = run_locked(&ready(), &link(device), "dev", &req).unwrap_err();
        assert!(matches!(
            err,
            DriverError::Device {
                fault: DeviceFault::Rejected { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_transport_fault_flushes_once() {
        let device = MockDevice::new().fail_on("MEAS?");
        let log = device.log();
        let req = request(CommandDescriptor::new("measure", "MEAS?"), "MEAS?", false);
        let err = run_locked(&ready(), &link(device), "dev", &req).unwrap_err();
        assert!(err.is_transport_fault());
        assert_eq!(log.flush_count(), 1);
    }

    #[test]
    fn test_failing_recovery_flush_keeps_original_fault() {
        let device = MockDevice::new().fail_on("MEAS?").fail_flush(true);
        let req = request(CommandDescriptor::new("measure", "MEAS?"), "MEAS?", false);
        let err = run_locked(&ready(), &link(device), "dev", &req).unwrap_err();
        assert!(err.to_string().contains("mock link failure"), "{err}");
    }

    #[test]
    fn test_closed_link_rejects_calls() {
        let device = MockDevice::new();
        let log = device.log();
        let closed = Mutex::new(DriverState::Closed);
        let req = request(CommandDescriptor::new("get_identity", "*IDN"), "*IDN", false);
        assert!(matches!(
            run_locked(&closed, &link(device), "dev", &req),
            Err(DriverError::State(_))
        ));
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_shutdown_closes_once() {
        let device = MockDevice::new();
        let log = device.log();
        let cell = link(device);
        cell.borrow_mut().shutdown("dev");
        cell.borrow_mut().shutdown("dev");
        assert_eq!(log.close_count(), 1);
    }
}
