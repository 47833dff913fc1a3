//! Method synthesis
//!
//! [`Method::synthesize`] checks a [`CommandDescriptor`] once, at registration,
//! and produces the callable form used by drivers: it knows how to bind
//! positional and keyword arguments to the descriptor's parameters, turn them into
//! wire tokens, and assemble the outgoing command string.
//!
//! Binding follows the usual call rules: positionals fill parameters in order,
//! keywords fill them by name, omitted parameters take their default, and any
//! leftover, duplicate, unknown or missing argument is an argument error.

use crate::descriptor::{Arg, CommandDescriptor, ResponseParser};
use crate::error::{DriverError, DriverResult};
use crate::value::Value;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

/// Argument and method names must look like identifiers.
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w+$").expect("Invalid identifier regex"));

/// Arguments for one call of a synthesized method.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    positional: Vec<Value>,
    keyword: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Append a keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.push((name.into(), value.into()));
        self
    }

    pub fn from_parts(positional: Vec<Value>, keyword: Vec<(String, Value)>) -> Self {
        Self {
            positional,
            keyword,
        }
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keyword(&self) -> &[(String, Value)] {
        &self.keyword
    }
}

/// Build [`CallArgs`]: positionals first, then `name = value` keywords.
///
/// ```
/// use generic_scpi_driver::args;
///
/// let a = args![0, 5.4];
/// assert_eq!(a.positional().len(), 2);
///
/// let b = args![0; voltage = 5.4];
/// assert_eq!(b.keyword()[0].0, "voltage");
/// ```
#[macro_export]
macro_rules! args {
    () => {
        $crate::synth::CallArgs::new()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::synth::CallArgs::new()$(.arg($value))+
    };
    ($($value:expr),* ; $($name:ident = $kw:expr),+ $(,)?) => {
        $crate::synth::CallArgs::new()$(.arg($value))*$(.kwarg(stringify!($name), $kw))+
    };
}

/// Introspectable description of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSignature {
    pub name: String,
    pub default: Option<Value>,
}

/// Introspectable description of a synthesized method.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodSignature {
    pub name: String,
    pub params: Vec<ParamSignature>,
    pub doc: String,
    pub concurrent: bool,
    pub expects_response: bool,
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match &param.default {
                Some(default) => write!(f, "{}={}", param.name, default)?,
                None => write!(f, "{}", param.name)?,
            }
        }
        write!(f, ")")
    }
}

/// A command descriptor in callable form.
#[derive(Debug, Clone)]
pub struct Method {
    descriptor: CommandDescriptor,
    signature: MethodSignature,
}

impl Method {
    /// Validate a descriptor and prepare it for dispatch.
    ///
    /// # Errors
    /// `DriverError::Configuration` if the method name or prefix is empty, a
    /// name is not identifier-like, argument names repeat, or a required
    /// argument follows one with a default.
    pub fn synthesize(descriptor: CommandDescriptor) -> DriverResult<Self> {
        let name = descriptor.method_name.as_str();
        if !IDENTIFIER.is_match(name) {
            return Err(DriverError::Configuration(format!(
                "'{name}' is an invalid method name"
            )));
        }
        if descriptor.wire_prefix.trim().is_empty() {
            return Err(DriverError::Configuration(format!(
                "'{name}' has an empty wire prefix"
            )));
        }

        let mut seen = HashSet::new();
        let mut defaults_started = false;
        for arg in &descriptor.args {
            if !IDENTIFIER.is_match(&arg.name) {
                return Err(DriverError::Configuration(format!(
                    "'{}' is an invalid argument name",
                    arg.name
                )));
            }
            if !seen.insert(arg.name.as_str()) {
                return Err(DriverError::Configuration(format!(
                    "'{name}' declares argument '{}' twice",
                    arg.name
                )));
            }
            match (&arg.default, defaults_started) {
                (Some(_), _) => defaults_started = true,
                (None, true) => {
                    return Err(DriverError::Configuration(format!(
                        "'{name}': argument '{}' without a default follows arguments with defaults",
                        arg.name
                    )))
                }
                (None, false) => {}
            }
        }

        let signature = MethodSignature {
            name: name.to_string(),
            params: descriptor
                .args
                .iter()
                .map(|arg| ParamSignature {
                    name: arg.name.clone(),
                    default: arg.default.clone(),
                })
                .collect(),
            doc: descriptor
                .doc
                .clone()
                .unwrap_or_else(|| generated_doc(&descriptor)),
            concurrent: descriptor.concurrent,
            expects_response: descriptor.response_parser.expects_response(),
        };

        Ok(Self {
            descriptor,
            signature,
        })
    }

    pub fn name(&self) -> &str {
        &self.signature.name
    }

    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    pub fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    pub fn is_concurrent(&self) -> bool {
        self.descriptor.concurrent
    }

    pub(crate) fn parser(&self) -> &ResponseParser {
        &self.descriptor.response_parser
    }

    /// Bind call arguments to parameters and produce wire tokens, in order.
    ///
    /// No I/O happens here; every failure is a `DriverError::Argument`.
    pub fn bind(&self, call: &CallArgs) -> DriverResult<Vec<String>> {
        let params = &self.descriptor.args;
        if call.positional.len() > params.len() {
            return Err(DriverError::argument(
                self.name(),
                "*",
                format!(
                    "takes {} arguments but {} were given",
                    params.len(),
                    call.positional.len()
                ),
            ));
        }

        let mut slots: Vec<Option<&Value>> = vec![None; params.len()];
        for (slot, value) in slots.iter_mut().zip(&call.positional) {
            *slot = Some(value);
        }
        for (key, value) in &call.keyword {
            let index = params
                .iter()
                .position(|p| &p.name == key)
                .ok_or_else(|| {
                    DriverError::argument(self.name(), key, "unexpected keyword argument")
                })?;
            if slots[index].is_some() {
                return Err(DriverError::argument(
                    self.name(),
                    key,
                    "got multiple values for argument",
                ));
            }
            slots[index] = Some(value);
        }

        params
            .iter()
            .zip(slots)
            .map(|(param, slot)| {
                let value = slot.or(param.default.as_ref()).ok_or_else(|| {
                    DriverError::argument(self.name(), &param.name, "missing required argument")
                })?;
                self.encode_arg(param, value)
            })
            .collect()
    }

    fn encode_arg(&self, param: &Arg, value: &Value) -> DriverResult<String> {
        match &param.validator {
            Some(validator) => validator(value).map_err(|e| {
                DriverError::argument(self.name(), &param.name, format!("{e:#}"))
            }),
            None => value.to_wire().ok_or_else(|| {
                DriverError::argument(self.name(), &param.name, "value has no wire form")
            }),
        }
    }

    /// Assemble the outgoing command: prefix then tokens, joined by `separator`.
    pub fn encode(&self, tokens: &[String], separator: &str) -> String {
        std::iter::once(self.descriptor.wire_prefix.as_str())
            .chain(tokens.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(separator)
    }
}

fn generated_doc(descriptor: &CommandDescriptor) -> String {
    let names: Vec<&str> = descriptor.args.iter().map(|a| a.name.as_str()).collect();
    format!(
        "Query \"{}\"\n\nThis method is generated. It sends the command \"{}\" and expects {} arguments named {:?}.",
        descriptor.method_name,
        descriptor.wire_prefix,
        names.len(),
        names
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::validators;

    fn mode() -> Method {
        Method::synthesize(
            CommandDescriptor::new("get_mode", "MODE?")
                .arg(Arg::new("a"))
                .arg(Arg::new("b").with_default("second_arg_default")),
        )
        .unwrap()
    }

    #[test]
    fn test_positional_and_default() {
        let m = mode();
        let tokens = m.bind(&args!["first_arg"]).unwrap();
        assert_eq!(m.encode(&tokens, " "), "MODE? first_arg second_arg_default");
    }

    #[test]
    fn test_keywords_in_any_order() {
        let m = mode();
        let tokens = m.bind(&args![; b = "second_arg", a = "first_arg"]).unwrap();
        assert_eq!(m.encode(&tokens, " "), "MODE? first_arg second_arg");
        let tokens = m.bind(&args!["first_arg"; b = "second_arg"]).unwrap();
        assert_eq!(m.encode(&tokens, " "), "MODE? first_arg second_arg");
    }

    #[test]
    fn test_binding_errors() {
        let m = mode();
        for bad in [
            args![],
            args![1, 2, 3],
            args![; a = "x", c = "y"],
            args!["x"; a = "y"],
        ] {
            let err = m.bind(&bad).unwrap_err();
            assert!(matches!(err, DriverError::Argument { .. }), "{bad:?}: {err}");
        }
    }

    #[test]
    fn test_validator_output_goes_on_wire() {
        let m = Method::synthesize(
            CommandDescriptor::new("get_mode", "MODE?")
                .arg(Arg::new("a").with_validator(validators::fixed_point(1))),
        )
        .unwrap();
        let tokens = m.bind(&args![; a = 1.123]).unwrap();
        assert_eq!(m.encode(&tokens, " "), "MODE? 1.1");
    }

    #[test]
    fn test_defaults_pass_through_validator() {
        let m = Method::synthesize(
            CommandDescriptor::new("set_range", "RANG")
                .arg(Arg::new("range").with_default(3).with_validator(validators::int_range(0, 8))),
        )
        .unwrap();
        assert_eq!(m.bind(&args![]).unwrap(), vec!["3".to_string()]);
    }

    #[test]
    fn test_required_after_default_rejected() {
        let err = Method::synthesize(
            CommandDescriptor::new("get_mode", "MODE?")
                .arg(Arg::new("b").with_default("x"))
                .arg(Arg::new("a")),
        )
        .unwrap_err();
        assert!(matches!(err, DriverError::Configuration(_)));
    }

    #[test]
    fn test_bad_names_rejected() {
        assert!(Method::synthesize(CommandDescriptor::new("get mode", "MODE?")).is_err());
        assert!(Method::synthesize(CommandDescriptor::new("get_mode", "  ")).is_err());
        assert!(Method::synthesize(
            CommandDescriptor::new("get_mode", "MODE?").arg(Arg::new("a-b"))
        )
        .is_err());
        assert!(Method::synthesize(
            CommandDescriptor::new("get_mode", "MODE?")
                .arg(Arg::new("a"))
                .arg(Arg::new("a"))
        )
        .is_err());
    }

    #[test]
    fn test_signature_display_and_doc() {
        let m = mode();
        assert_eq!(m.signature().to_string(), "get_mode(a, b=\"second_arg_default\")");
        assert!(m.signature().doc.contains("MODE?"));
        assert!(m.signature().expects_response);
    }
}
