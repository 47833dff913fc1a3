//! Driver instances
//!
//! A [`Driver`] is one connection to one device, created from a
//! [`DriverClass`]. It owns exactly one transport, guarded by a re-entrant
//! lock, and exposes every method in the class registry by name.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting ──► HealthChecking ──► Ready ──► Closed
//!      │               │                        ▲
//!      └───────────────┴── failure ─────────────┘
//! ```
//!
//! - **Connecting**: open the real transport through the class's factory, or
//!   instantiate the registered simulator in simulation mode. Flush once.
//! - **HealthChecking**: run the class's health check, if any. Methods are
//!   callable from inside the check. A failing check closes the transport and
//!   construction fails with `DriverError::Connection`.
//! - **Ready**: methods are callable.
//! - **Closed**: after [`Driver::close`] or once the last handle is dropped.
//!   The transport is closed exactly once; later calls fail with
//!   `DriverError::State`.
//!
//! ## Blocking and concurrent calls
//!
//! [`Driver::call`] runs the whole pipeline on the calling thread.
//! [`Driver::spawn`] binds and encodes the arguments on the calling thread, then
//! runs the locked exchange on Tokio's blocking pool and returns a
//! [`PendingCall`]. The lock is taken inside the worker, so concurrent calls on
//! one driver still serialize at the transport while different drivers never
//! contend. [`Driver::invoke`] picks between the two according to the
//! descriptor's `concurrent` flag.
//!
//! # Example
//!
//! ```
//! use generic_scpi_driver::{args, Driver, DriverClass, DriverOptions, Value};
//! use generic_scpi_driver::transport::MockDevice;
//!
//! let class = DriverClass::builder("Demo")
//!     .register_query("get_identity", "*IDN")?
//!     .simulator_factory(MockDevice::new().respond("*IDN", "Simulator device").factory())
//!     .build();
//!
//! let dev = Driver::connect(&class, "sim", DriverOptions::simulated())?;
//! assert_eq!(dev.call("get_identity", args![])?, Value::from("Simulator device"));
//! # Ok::<(), generic_scpi_driver::DriverError>(())
//! ```

use crate::dispatch::{self, Link, LinkLock, Request, StateCell};
use crate::error::{DeviceFault, DriverError, DriverResult};
use crate::registry::DriverClass;
use crate::synth::{CallArgs, Method, MethodSignature};
use crate::transport::{SimulatedTransport, Transport, TransportConfig};
use crate::value::{Value, ValueTypeError};
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriverState {
    Connecting,
    HealthChecking,
    Ready,
    Closed,
}

impl DriverState {
    pub fn accepts_calls(self) -> bool {
        matches!(self, Self::HealthChecking | Self::Ready)
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::HealthChecking => write!(f, "HealthChecking"),
            Self::Ready => write!(f, "Ready"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// How to construct a driver.
#[derive(Debug, Clone, Default)]
pub struct DriverOptions {
    /// Use the class's simulator instead of opening hardware
    pub simulation: bool,
    /// Transport parameters; the class defaults when `None`
    pub transport: Option<TransportConfig>,
}

impl DriverOptions {
    pub fn simulated() -> Self {
        Self {
            simulation: true,
            transport: None,
        }
    }

    pub fn with_simulation(mut self, simulation: bool) -> Self {
        self.simulation = simulation;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = Some(transport);
        self
    }
}

struct Shared {
    id: String,
    class: Arc<DriverClass>,
    config: TransportConfig,
    state: StateCell,
    link: LinkLock,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let link = self.link.get_mut().get_mut();
        if link.transport.is_some() {
            debug!(device = %self.id, "Driver dropped; closing transport");
            *self.state.get_mut() = DriverState::Closed;
            link.shutdown(&self.id);
        }
    }
}

/// Handle to one connected device. Clones share the connection.
#[derive(Clone)]
pub struct Driver {
    shared: Arc<Shared>,
}

impl Driver {
    /// Open a connection for `class` to the device identified by `id`.
    ///
    /// # Errors
    /// - `DriverError::Configuration` if `id` is empty, or simulation is
    ///   requested for a class without a simulator (no transport is opened).
    /// - `DriverError::Connection` if the transport cannot be opened or the
    ///   health check fails (the transport is closed first).
    pub fn connect(class: &Arc<DriverClass>, id: &str, options: DriverOptions) -> DriverResult<Self> {
        if id.trim().is_empty() {
            return Err(DriverError::Configuration(
                "A device id is required".to_string(),
            ));
        }
        let config = options
            .transport
            .unwrap_or_else(|| class.defaults().clone());

        info!(
            device = id,
            class = class.name(),
            simulation = options.simulation,
            "Creating driver"
        );

        let mut transport: Box<dyn Transport> = if options.simulation {
            let factory = class.simulator().ok_or_else(|| {
                DriverError::Configuration(format!(
                    "Simulation requested but '{}' has no registered simulator",
                    class.name()
                ))
            })?;
            Box::new(SimulatedTransport::new(factory()))
        } else {
            (class.transport_factory())(id, &config).map_err(|reason| DriverError::Connection {
                id: id.to_string(),
                reason,
            })?
        };

        if let Err(e) = transport.flush() {
            if let Err(close_error) = transport.close() {
                warn!(
                    device = id,
                    "Error while closing {} after failed flush: {}",
                    transport.describe(),
                    close_error
                );
            }
            return Err(DriverError::Connection {
                id: id.to_string(),
                reason: anyhow::Error::new(e).context("Initial flush failed"),
            });
        }
        debug!(device = id, transport = %transport.describe(), "Transport open");

        let driver = Self {
            shared: Arc::new(Shared {
                id: id.to_string(),
                class: Arc::clone(class),
                config,
                state: Mutex::new(DriverState::HealthChecking),
                link: ReentrantMutex::new(RefCell::new(Link::new(transport))),
            }),
        };

        if let Some(check) = class.health_check() {
            if let Err(reason) = check(&driver) {
                warn!(device = id, "Health check failed: {:#}", reason);
                driver.close();
                return Err(DriverError::Connection {
                    id: id.to_string(),
                    reason: reason.context("Health check failed"),
                });
            }
        }

        driver.set_state(DriverState::Ready)?;
        info!(device = id, class = class.name(), "Connected");
        Ok(driver)
    }

    /// Shorthand for a simulated driver with the class's transport defaults.
    pub fn simulated(class: &Arc<DriverClass>, id: &str) -> DriverResult<Self> {
        Self::connect(class, id, DriverOptions::simulated())
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn class(&self) -> &Arc<DriverClass> {
        &self.shared.class
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn state(&self) -> DriverState {
        *self.shared.state.lock()
    }

    /// Liveness probe for controller supervisors.
    pub fn ping(&self) -> bool {
        true
    }

    /// Signatures of every callable method, sorted by name.
    pub fn methods(&self) -> Vec<MethodSignature> {
        self.shared.class.signatures()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.shared.class.lookup(name).is_some()
    }

    /// Call a method and wait for its result on this thread.
    pub fn call(&self, name: &str, args: CallArgs) -> DriverResult<Value> {
        let request = self.prepare(name, &args)?;
        dispatch::with_lock(&self.shared.link, |link| {
            dispatch::run_locked(&self.shared.state, link, &self.shared.id, &request)
        })
    }

    /// Call a method and convert the result.
    ///
    /// A result of the wrong type is reported as an unparseable response.
    pub fn call_as<T>(&self, name: &str, args: CallArgs) -> DriverResult<T>
    where
        T: TryFrom<Value, Error = ValueTypeError>,
    {
        let value = self.call(name, args)?;
        let response = value.to_string();
        T::try_from(value).map_err(|e| DriverError::Device {
            method: name.to_string(),
            fault: DeviceFault::Unparseable {
                response,
                reason: e.into(),
            },
        })
    }

    /// Run a method on the blocking pool of the current Tokio runtime.
    ///
    /// Argument errors are returned here, before anything is scheduled.
    ///
    /// # Errors
    /// `DriverError::Runtime` when called outside a Tokio runtime.
    pub fn spawn(&self, name: &str, args: CallArgs) -> DriverResult<PendingCall> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DriverError::Runtime(e.to_string()))?;
        let request = self.prepare(name, &args)?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let shared = Arc::clone(&self.shared);
        let method = name.to_string();

        let task = runtime.spawn_blocking(move || {
            if flag.load(Ordering::SeqCst) {
                return Err(DriverError::Cancelled(method));
            }
            dispatch::with_lock(&shared.link, |link| {
                // Cancellation is honoured up to the moment the lock is held.
                if flag.load(Ordering::SeqCst) {
                    return Err(DriverError::Cancelled(method));
                }
                dispatch::run_locked(&shared.state, link, &shared.id, &request)
            })
        });

        Ok(PendingCall {
            method: name.to_string(),
            task,
            cancelled,
            cancel_on_drop: true,
        })
    }

    /// Call a method the way its descriptor asks: blocking methods return their
    /// value, concurrent ones a [`PendingCall`].
    pub fn invoke(&self, name: &str, args: CallArgs) -> DriverResult<Reply> {
        self.ensure_open()?;
        if self.lookup(name)?.is_concurrent() {
            self.spawn(name, args).map(Reply::Pending)
        } else {
            self.call(name, args).map(Reply::Value)
        }
    }

    /// Close the transport. Later calls fail with `DriverError::State`;
    /// closing again does nothing.
    pub fn close(&self) {
        dispatch::with_lock(&self.shared.link, |link| match link.try_borrow_mut() {
            Ok(mut link) => {
                let mut state = self.shared.state.lock();
                if *state != DriverState::Closed {
                    *state = DriverState::Closed;
                    drop(state);
                    link.shutdown(&self.shared.id);
                    info!(device = %self.shared.id, "Driver closed");
                }
            }
            Err(_) => warn!(
                device = %self.shared.id,
                "close() called from inside a transport exchange; ignored"
            ),
        })
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.state().accepts_calls() {
            Ok(())
        } else {
            Err(DriverError::State(self.shared.id.clone()))
        }
    }

    fn lookup(&self, name: &str) -> DriverResult<Arc<Method>> {
        self.shared
            .class
            .lookup(name)
            .ok_or_else(|| DriverError::UnknownMethod(name.to_string()))
    }

    /// Resolve, bind and encode a call. A driver that no longer accepts calls
    /// fails here, before any argument is looked at.
    fn prepare(&self, name: &str, args: &CallArgs) -> DriverResult<Request> {
        self.ensure_open()?;
        let method = self.lookup(name)?;
        let tokens = method.bind(args)?;
        let command = method.encode(&tokens, &self.shared.config.command_separator);
        Ok(Request {
            method,
            command,
            flush_first: self.shared.config.flush_before_command,
        })
    }

    fn set_state(&self, state: DriverState) -> DriverResult<()> {
        dispatch::with_lock(&self.shared.link, |_| {
            let mut current = self.shared.state.lock();
            if *current == DriverState::Closed {
                return Err(DriverError::State(self.shared.id.clone()));
            }
            *current = state;
            Ok(())
        })
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("id", &self.shared.id)
            .field("class", &self.shared.class.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Result of [`Driver::invoke`].
#[derive(Debug)]
pub enum Reply {
    Value(Value),
    Pending(PendingCall),
}

impl Reply {
    /// Wait for the value, whichever form it took.
    pub async fn resolve(self) -> DriverResult<Value> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Pending(pending) => pending.await,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// A call running on the blocking pool.
///
/// Awaiting yields the method's result. [`cancel`](Self::cancel), or dropping
/// the handle, stops the call only if it has not yet taken the driver lock; once
/// it holds the lock it runs to completion and releases it, and the result is
/// discarded. Use [`detach`](Self::detach) to let it run without waiting.
pub struct PendingCall {
    method: String,
    task: JoinHandle<DriverResult<Value>>,
    cancelled: Arc<AtomicBool>,
    cancel_on_drop: bool,
}

impl PendingCall {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Let the call run to completion without keeping the handle.
    pub fn detach(mut self) {
        self.cancel_on_drop = false;
    }
}

impl Future for PendingCall {
    type Output = DriverResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let polled = Pin::new(&mut self.task).poll(cx);
        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DriverError::Cancelled(self.method.clone()))),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.cancel_on_drop && !self.task.is_finished() {
            self.cancel();
        }
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("method", &self.method)
            .field("finished", &self.task.is_finished())
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}
