//! Command and argument descriptors
//!
//! A [`CommandDescriptor`] is the declarative form of one device command: the
//! wire prefix, the ordered [`Arg`]s that follow it, and how the reply is
//! handled. Descriptors are registered on a
//! [`DriverClassBuilder`](crate::registry::DriverClassBuilder), which turns each
//! one into a callable method.
//!
//! ```
//! use generic_scpi_driver::descriptor::{Arg, CommandDescriptor, ResponseParser};
//! use generic_scpi_driver::validators;
//!
//! let set_voltage = CommandDescriptor::new("set_voltage", "VOLT")
//!     .arg(Arg::new("channel"))
//!     .arg(Arg::new("voltage").with_validator(validators::float_range(0.0, 10.0)))
//!     .parser(ResponseParser::Suppressed);
//! assert_eq!(set_voltage.args().len(), 2);
//! ```

use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Turns a raw argument into its wire token, or rejects it.
pub type ArgValidator = Arc<dyn Fn(&Value) -> anyhow::Result<String> + Send + Sync>;

/// Checks a raw response. Its return value is discarded.
pub type ResponseValidator = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

/// Turns a raw response into a [`Value`].
pub type ParseFn = Arc<dyn Fn(&str) -> anyhow::Result<Value> + Send + Sync>;

/// One positional/keyword parameter of a command.
#[derive(Clone)]
pub struct Arg {
    pub(crate) name: String,
    pub(crate) validator: Option<ArgValidator>,
    pub(crate) default: Option<Value>,
}

impl Arg {
    /// A required argument sent in its canonical wire form.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            validator: None,
            default: None,
        }
    }

    /// Set a validator. Its return value, not the raw argument, goes on the wire.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Make the argument optional.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn has_validator(&self) -> bool {
        self.validator.is_some()
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arg")
            .field("name", &self.name)
            .field("validator", &self.validator.is_some())
            .field("default", &self.default)
            .finish()
    }
}

/// How the reply to a command is handled.
#[derive(Clone, Default)]
pub enum ResponseParser {
    /// Return the raw response as a string.
    #[default]
    Identity,
    /// Do not read a reply at all; the call returns [`Value::None`].
    Suppressed,
    /// Parse the raw response with a custom function.
    Custom(ParseFn),
}

impl ResponseParser {
    /// Wrap a parsing function.
    pub fn custom<F>(parse: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(parse))
    }

    /// Parse the (trimmed) response as an integer.
    pub fn int() -> Self {
        Self::custom(|raw| Ok(Value::Int(raw.trim().parse::<i64>()?)))
    }

    /// Parse the (trimmed) response as a float.
    pub fn float() -> Self {
        Self::custom(|raw| Ok(Value::Float(raw.trim().parse::<f64>()?)))
    }

    /// Parse `1`/`0`/`ON`/`OFF` (case-insensitive) as a boolean.
    pub fn boolean() -> Self {
        Self::custom(|raw| match raw.trim().to_ascii_uppercase().as_str() {
            "1" | "ON" => Ok(Value::Bool(true)),
            "0" | "OFF" => Ok(Value::Bool(false)),
            other => anyhow::bail!("'{other}' is not a boolean"),
        })
    }

    /// Whether a reply is read after sending.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Self::Suppressed)
    }

    pub(crate) fn parse(&self, raw: &str) -> anyhow::Result<Value> {
        match self {
            Self::Identity => Ok(Value::Str(raw.to_string())),
            Self::Suppressed => Ok(Value::None),
            Self::Custom(parse) => parse(raw),
        }
    }
}

impl fmt::Debug for ResponseParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => write!(f, "Identity"),
            Self::Suppressed => write!(f, "Suppressed"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Full declaration of one device command.
#[derive(Clone)]
pub struct CommandDescriptor {
    pub(crate) method_name: String,
    pub(crate) wire_prefix: String,
    pub(crate) args: Vec<Arg>,
    pub(crate) response_parser: ResponseParser,
    pub(crate) response_validator: Option<ResponseValidator>,
    pub(crate) concurrent: bool,
    pub(crate) doc: Option<String>,
}

impl CommandDescriptor {
    /// A query with no arguments whose reply is returned as-is.
    pub fn new(method_name: impl Into<String>, wire_prefix: impl Into<String>) -> Self {
        Self {
            method_name: method_name.into(),
            wire_prefix: wire_prefix.into(),
            args: Vec::new(),
            response_parser: ResponseParser::Identity,
            response_validator: None,
            concurrent: false,
            doc: None,
        }
    }

    /// Append an argument. Order matters: it is the wire order.
    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn args_from(mut self, args: impl IntoIterator<Item = Arg>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn parser(mut self, parser: ResponseParser) -> Self {
        self.response_parser = parser;
        self
    }

    /// Shorthand for `parser(ResponseParser::Suppressed)`.
    pub fn no_response(self) -> Self {
        self.parser(ResponseParser::Suppressed)
    }

    /// Check the raw reply before it is parsed. An error becomes a device error.
    pub fn response_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.response_validator = Some(Arc::new(validator));
        self
    }

    /// Run the call on a worker and hand back a pending handle.
    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn wire_prefix(&self) -> &str {
        &self.wire_prefix
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    pub fn response_parser(&self) -> &ResponseParser {
        &self.response_parser
    }

    pub fn is_concurrent(&self) -> bool {
        self.concurrent
    }
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("method_name", &self.method_name)
            .field("wire_prefix", &self.wire_prefix)
            .field("args", &self.args)
            .field("response_parser", &self.response_parser)
            .field("response_validator", &self.response_validator.is_some())
            .field("concurrent", &self.concurrent)
            .finish()
    }
}
