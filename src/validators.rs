//! Ready-made argument validators.
//!
//! Each function returns a closure suitable for [`Arg::with_validator`]. A
//! validator receives the raw argument and returns the token to put on the wire,
//! or an error which fails the call before any I/O.
//!
//! [`Arg::with_validator`]: crate::descriptor::Arg::with_validator

use crate::value::Value;
use anyhow::{anyhow, bail, Result};

fn number(value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| anyhow!("expected a number, got {value}"))
}

fn integer(value: &Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| anyhow!("expected an integer, got {value}"))
}

/// Accept numbers within `[min, max]`, sent in their shortest form.
pub fn float_range(min: f64, max: f64) -> impl Fn(&Value) -> Result<String> + Send + Sync + 'static {
    move |value| {
        let x = number(value)?;
        if !(min..=max).contains(&x) {
            bail!("{x} is outside {min}..={max}");
        }
        Ok(x.to_string())
    }
}

/// Accept integers within `[min, max]`.
pub fn int_range(min: i64, max: i64) -> impl Fn(&Value) -> Result<String> + Send + Sync + 'static {
    move |value| {
        let n = integer(value)?;
        if !(min..=max).contains(&n) {
            bail!("{n} is outside {min}..={max}");
        }
        Ok(n.to_string())
    }
}

/// Format any number with a fixed count of decimals, e.g. `1.123` -> `1.1`.
pub fn fixed_point(decimals: usize) -> impl Fn(&Value) -> Result<String> + Send + Sync + 'static {
    move |value| Ok(format!("{:.*}", decimals, number(value)?))
}

/// Accept one of a fixed set of tokens (case-insensitive), sent as listed.
pub fn one_of(choices: &[&str]) -> impl Fn(&Value) -> Result<String> + Send + Sync + 'static {
    let choices: Vec<String> = choices.iter().map(|c| c.to_string()).collect();
    move |value| {
        let token = value
            .to_wire()
            .ok_or_else(|| anyhow!("expected one of {choices:?}, got {value}"))?;
        choices
            .iter()
            .find(|c| c.eq_ignore_ascii_case(&token))
            .cloned()
            .ok_or_else(|| anyhow!("'{token}' is not one of {choices:?}"))
    }
}

/// Map booleans (or 0/1) onto `ON`/`OFF`.
pub fn on_off() -> impl Fn(&Value) -> Result<String> + Send + Sync + 'static {
    |value| match value.as_bool() {
        Some(true) => Ok("ON".to_string()),
        Some(false) => Ok("OFF".to_string()),
        None => bail!("expected a boolean, got {value}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_range() {
        let v = float_range(0.0, 10.0);
        assert_eq!(v(&Value::from(5.4)).unwrap(), "5.4");
        assert_eq!(v(&Value::from(10)).unwrap(), "10");
        assert!(v(&Value::from(15)).is_err());
        assert!(v(&Value::from("five")).is_err());
    }

    #[test]
    fn test_int_range_rejects_fractions() {
        let v = int_range(1, 2);
        assert_eq!(v(&Value::from(2)).unwrap(), "2");
        assert!(v(&Value::from(1.5)).is_err());
        assert!(v(&Value::from(3)).is_err());
    }

    #[test]
    fn test_fixed_point() {
        let v = fixed_point(1);
        assert_eq!(v(&Value::from(1.123)).unwrap(), "1.1");
    }

    #[test]
    fn test_one_of() {
        let v = one_of(&["CURR", "VOLT"]);
        assert_eq!(v(&Value::from("volt")).unwrap(), "VOLT");
        assert!(v(&Value::from("POW")).is_err());
    }

    #[test]
    fn test_on_off() {
        let v = on_off();
        assert_eq!(v(&Value::from(true)).unwrap(), "ON");
        assert_eq!(v(&Value::from(0)).unwrap(), "OFF");
        assert!(v(&Value::from("maybe")).is_err());
    }
}
