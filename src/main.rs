//! Demonstration controller for a three-channel bench power supply.
//!
//! ```text
//! scpi-demo-controller --simulation -p 3251
//! scpi-demo-controller --id "USB VID:PID=0403:6001" -v
//! ```

use anyhow::{bail, Result};
use generic_scpi_driver::transport::Simulator;
use generic_scpi_driver::validators::{fixed_point, int_range, on_off};
use generic_scpi_driver::{args, controller, Arg, CommandDescriptor, DriverClass, ResponseParser};
use std::collections::BTreeMap;
use std::sync::Arc;

const DEFAULT_PORT: u16 = 3251;
const MAX_VOLTAGE: f64 = 30.0;
/// Load seen by the simulated outputs, in ohms.
const SIMULATED_LOAD: f64 = 10.0;

fn channel() -> Arg {
    Arg::new("channel").with_validator(int_range(1, 3))
}

fn bench_supply_class() -> Result<Arc<DriverClass>> {
    let class = DriverClass::builder("BenchSupply")
        .register(
            CommandDescriptor::new("get_identity", "*IDN?")
                .response_validator(|raw| {
                    anyhow::ensure!(!raw.trim().is_empty(), "empty identity");
                    Ok(())
                })
                .doc("Manufacturer, model, serial number and firmware version."),
        )?
        .register(
            CommandDescriptor::new("set_voltage", "VOLT")
                .arg(channel())
                .arg(Arg::new("voltage").with_validator(|v| {
                    let volts = v
                        .as_f64()
                        .ok_or_else(|| anyhow::anyhow!("expected a number, got {v}"))?;
                    anyhow::ensure!(
                        (0.0..=MAX_VOLTAGE).contains(&volts),
                        "{volts} V is outside 0..={MAX_VOLTAGE} V"
                    );
                    fixed_point(3)(v)
                }))
                .no_response(),
        )?
        .register(
            CommandDescriptor::new("get_voltage", "VOLT?")
                .arg(channel())
                .parser(ResponseParser::float()),
        )?
        .register(
            CommandDescriptor::new("set_output", "OUTP")
                .arg(Arg::new("enabled").with_validator(on_off()))
                .no_response(),
        )?
        .register(CommandDescriptor::new("get_output", "OUTP?").parser(ResponseParser::boolean()))?
        .register(
            CommandDescriptor::new("measure_current", "MEAS:CURR?")
                .arg(channel())
                .parser(ResponseParser::float())
                .concurrent(true),
        )?
        .register_simulator(BenchSupplySimulator::default)
        .health_check(|dev| {
            let identity = dev.call_as::<String>("get_identity", args![])?;
            anyhow::ensure!(
                identity.contains("BENCH"),
                "'{identity}' does not look like a bench supply"
            );
            Ok(())
        })
        .build();
    Ok(class)
}

/// In-memory stand-in for the supply.
#[derive(Debug, Default)]
struct BenchSupplySimulator {
    voltages: BTreeMap<u8, f64>,
    output: bool,
}

impl BenchSupplySimulator {
    fn channel(token: Option<&str>) -> Result<u8> {
        match token.map(str::parse::<u8>) {
            Some(Ok(ch)) if (1..=3).contains(&ch) => Ok(ch),
            _ => bail!("bad channel {token:?}"),
        }
    }
}

impl Simulator for BenchSupplySimulator {
    fn query(&mut self, command: &str) -> Result<String> {
        let mut tokens = command.split_whitespace();
        let reply = match tokens.next() {
            Some("*IDN?") => "ACME Instruments,BENCH-3,0,1.0 (simulated)".to_string(),
            Some("VOLT") => {
                let ch = Self::channel(tokens.next())?;
                let volts = tokens.next().unwrap_or_default().parse::<f64>()?;
                self.voltages.insert(ch, volts);
                String::new()
            }
            Some("VOLT?") => {
                let ch = Self::channel(tokens.next())?;
                format!("{:.3}", self.voltages.get(&ch).copied().unwrap_or(0.0))
            }
            Some("OUTP") => {
                self.output = tokens.next() == Some("ON");
                String::new()
            }
            Some("OUTP?") => String::from(if self.output { "1" } else { "0" }),
            Some("MEAS:CURR?") => {
                let ch = Self::channel(tokens.next())?;
                let volts = if self.output {
                    self.voltages.get(&ch).copied().unwrap_or(0.0)
                } else {
                    0.0
                };
                format!("{:.4}", volts / SIMULATED_LOAD)
            }
            other => bail!("unknown command {other:?}"),
        };
        Ok(reply)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    controller::run("bench_supply", DEFAULT_PORT, bench_supply_class()?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use generic_scpi_driver::{Driver, Value};

    #[test]
    fn test_simulated_supply() {
        let dev = Driver::simulated(&bench_supply_class().unwrap(), "sim").unwrap();
        dev.call("set_voltage", args![2, 5]).unwrap();
        dev.call("set_output", args![true]).unwrap();
        assert_eq!(dev.call("get_voltage", args![2]).unwrap(), Value::Float(5.0));
        assert_eq!(dev.call("get_output", args![]).unwrap(), Value::Bool(true));
        assert_eq!(dev.call("measure_current", args![2]).unwrap(), Value::Float(0.5));
    }

    #[test]
    fn test_channel_and_voltage_limits() {
        let dev = Driver::simulated(&bench_supply_class().unwrap(), "sim").unwrap();
        assert!(dev.call("set_voltage", args![4, 1.0]).is_err());
        assert!(dev.call("set_voltage", args![1, 31.0]).is_err());
    }
}
