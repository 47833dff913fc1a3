//! Declarative drivers for SCPI-style instruments.
//!
//! Instead of writing one method per device command, a driver author lists
//! [`CommandDescriptor`]s on a [`DriverClass`]. Each descriptor is synthesized
//! into a callable method at registration time; a [`Driver`] created from the
//! class exposes those methods by name and takes care of argument binding, wire
//! encoding, locking, transport recovery and response decoding.
//!
//! ```
//! use generic_scpi_driver::{args, Arg, CommandDescriptor, Driver, DriverClass, DriverError};
//! use generic_scpi_driver::transport::MockDevice;
//! use generic_scpi_driver::validators::float_range;
//!
//! let device = MockDevice::new().respond("*IDN", "Simulator device");
//! let log = device.log();
//!
//! let class = DriverClass::builder("Supply")
//!     .register_query("get_identity", "*IDN")?
//!     .register(
//!         CommandDescriptor::new("set_voltage", "VOLT")
//!             .arg(Arg::new("channel"))
//!             .arg(Arg::new("voltage").with_validator(float_range(0.0, 10.0)))
//!             .no_response(),
//!     )?
//!     .simulator_factory(device.factory())
//!     .build();
//!
//! let dev = Driver::simulated(&class, "sim")?;
//! assert_eq!(dev.call_as::<String>("get_identity", args![])?, "Simulator device");
//!
//! dev.call("set_voltage", args![0, 5.4])?;
//! assert_eq!(log.last_command().as_deref(), Some("VOLT 0 5.4"));
//!
//! let err = dev.call("set_voltage", args![0, 15]).unwrap_err();
//! assert!(matches!(err, DriverError::Argument { .. }));
//! # Ok::<(), DriverError>(())
//! ```
//!
//! ## Modules
//!
//! - [`descriptor`] and [`validators`]: declaring commands
//! - [`synth`]: turning a descriptor into a callable method
//! - [`registry`]: driver classes, inheritance and simulators
//! - [`driver`]: driver instances, blocking and concurrent calls
//! - [`transport`]: serial, simulated and mock transports
//! - [`controller`], [`config`], [`logging`]: serving a driver over TCP

pub mod config;
pub mod controller;
pub mod descriptor;
mod dispatch;
pub mod driver;
pub mod error;
pub mod logging;
pub mod registry;
pub mod synth;
pub mod transport;
pub mod validators;
pub mod value;

pub use descriptor::{Arg, CommandDescriptor, ResponseParser};
pub use driver::{Driver, DriverOptions, DriverState, PendingCall, Reply};
pub use error::{DeviceFault, DriverError, DriverResult, TransportError};
pub use registry::{CommandRegistry, DriverClass, DriverClassBuilder};
pub use synth::{CallArgs, Method, MethodSignature, ParamSignature};
pub use transport::{Transport, TransportConfig};
pub use value::Value;
