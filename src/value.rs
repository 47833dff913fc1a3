//! Dynamic values passed to and returned from synthesized methods.
//!
//! Synthesized methods are looked up by name at runtime, so their arguments and
//! results travel as [`Value`]. Conversions from the usual Rust scalars are
//! provided in both directions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Argument or response value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// No value (suppressed responses, `null` on the wire)
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Canonical token for this value in an outgoing command.
    ///
    /// Booleans are sent as `1`/`0`. `None` has no wire form.
    pub fn to_wire(&self) -> Option<String> {
        match self {
            Value::None => None,
            Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Str(s) => Some(s.clone()),
        }
    }

    /// Convert to f64 for numeric operations
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Convert to i64, accepting floats only when they are integral
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(v as i64)
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::None, Into::into)
    }
}

/// Error returned when a [`Value`] does not hold the requested type.
#[derive(Debug, thiserror::Error)]
#[error("expected {expected}, got {found}")]
pub struct ValueTypeError {
    expected: &'static str,
    found: Value,
}

impl TryFrom<Value> for String {
    type Error = ValueTypeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(ValueTypeError {
                expected: "string",
                found: other,
            }),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = ValueTypeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_f64().ok_or(ValueTypeError {
            expected: "float",
            found: value,
        })
    }
}

impl TryFrom<Value> for i64 {
    type Error = ValueTypeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_i64().ok_or(ValueTypeError {
            expected: "integer",
            found: value,
        })
    }
}

impl TryFrom<Value> for bool {
    type Error = ValueTypeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_bool().ok_or(ValueTypeError {
            expected: "bool",
            found: value,
        })
    }
}
