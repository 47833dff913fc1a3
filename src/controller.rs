//! Network controller
//!
//! Serves one [`Driver`] over TCP so that remote clients can call every
//! synthesized method by name. The protocol is newline-delimited JSON, one
//! request per line and one reply per request:
//!
//! ```text
//! -> {"method": "set_voltage", "args": [0], "kwargs": {"voltage": 5.4}}
//! <- {"status": "ok", "ret": null}
//! -> {"method": "set_voltage", "args": [0, 15]}
//! <- {"status": "failed", "kind": "argument", "message": "Invalid argument 'voltage' ..."}
//! ```
//!
//! Three method names are answered by the controller itself: `ping`,
//! `list_methods` (signatures of every method) and `target_name`.
//!
//! Driver calls run on Tokio's blocking pool, so a slow device never stalls
//! other connections; calls from all connections still serialize on the
//! driver's lock.

use crate::config::{ConfigError, ControllerConfig, ENV_PREFIX};
use crate::driver::{Driver, DriverOptions};
use crate::error::DriverError;
use crate::logging;
use crate::registry::DriverClass;
use crate::synth::CallArgs;
use crate::value::Value;
use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// One remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
}

impl RpcRequest {
    fn call_args(self) -> CallArgs {
        CallArgs::from_parts(self.args, self.kwargs.into_iter().collect())
    }
}

/// Reply to one [`RpcRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RpcResponse {
    Ok { ret: serde_json::Value },
    Failed { kind: String, message: String },
}

impl RpcResponse {
    fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<DriverError> for RpcResponse {
    fn from(err: DriverError) -> Self {
        Self::failed(err.kind(), err.to_string())
    }
}

/// Serves a driver to network clients.
pub struct Controller {
    name: String,
    driver: Driver,
}

impl Controller {
    pub fn new(name: impl Into<String>, driver: Driver) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            driver,
        })
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Answer one request.
    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        match request.method.as_str() {
            "ping" => RpcResponse::Ok {
                ret: serde_json::Value::Bool(self.driver.ping()),
            },
            "target_name" => RpcResponse::Ok {
                ret: serde_json::Value::String(self.name.clone()),
            },
            "list_methods" => match serde_json::to_value(self.driver.methods()) {
                Ok(ret) => RpcResponse::Ok { ret },
                Err(e) => RpcResponse::failed("internal", e.to_string()),
            },
            _ => {
                let method = request.method.clone();
                let pending = match self.driver.spawn(&method, request.call_args()) {
                    Ok(pending) => pending,
                    Err(e) => return e.into(),
                };
                match pending.await {
                    Ok(value) => match serde_json::to_value(value) {
                        Ok(ret) => RpcResponse::Ok { ret },
                        Err(e) => RpcResponse::failed("internal", e.to_string()),
                    },
                    Err(e) => {
                        debug!(method = %method, "Remote call failed: {}", e);
                        e.into()
                    }
                }
            }
        }
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    pub async fn serve_until<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(target_name = %self.name, "Controller shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.context("Failed to accept connection")?;
                    debug!(%peer, "Client connected");
                    let controller = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = controller.connection(stream).await {
                            warn!(%peer, "Connection closed with error: {:#}", e);
                        }
                    });
                }
            }
        }
        Ok(())
    }

    async fn connection(&self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<RpcRequest>(&line) {
                Ok(request) => self.handle(request).await,
                Err(e) => RpcResponse::failed("protocol", format!("Malformed request: {e}")),
            };
            let mut out = serde_json::to_string(&response)?;
            out.push('\n');
            writer.write_all(out.as_bytes()).await?;
        }
        Ok(())
    }
}

/// Serve `driver` on `addr` until Ctrl-C, then close it.
pub async fn serve(name: &str, driver: Driver, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(target_name = name, %addr, "Controller listening");

    let controller = Controller::new(name, driver.clone());
    controller
        .serve_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Could not listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    driver.close();
    Ok(())
}

/// Command-line arguments of a controller process.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about = "Network controller for a SCPI device")]
pub struct ControllerArgs {
    /// Device port path or hardware id, e.g. "USB VID:PID=0403:6001 SER=A6003SX4A"
    #[arg(long)]
    pub id: Option<String>,

    /// Drive the built-in simulator instead of hardware
    #[arg(long)]
    pub simulation: bool,

    /// TCP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    pub bind: Option<String>,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// More log output (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Less log output (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    pub quiet: u8,
}

impl ControllerArgs {
    /// Command-line flags override the configuration file and environment.
    pub fn apply(&self, config: &mut ControllerConfig) {
        if let Some(id) = &self.id {
            config.device.id = Some(id.clone());
        }
        if self.simulation {
            config.device.simulation = true;
        }
        if let Some(port) = self.port {
            config.server.port = Some(port);
        }
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
    }

    /// Configuration file and environment, overridden by these flags, validated once.
    pub fn resolve(&self) -> Result<ControllerConfig, ConfigError> {
        self.resolve_with_prefix(ENV_PREFIX)
    }

    fn resolve_with_prefix(&self, prefix: &str) -> Result<ControllerConfig, ConfigError> {
        let mut config = ControllerConfig::extract_with_prefix(self.config.as_deref(), prefix)?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}

/// Entry point for a controller binary: parse the command line and serve.
pub async fn run(name: &str, default_port: u16, class: Arc<DriverClass>) -> Result<()> {
    run_with(name, default_port, class, ControllerArgs::parse()).await
}

pub async fn run_with(
    name: &str,
    default_port: u16,
    class: Arc<DriverClass>,
    args: ControllerArgs,
) -> Result<()> {
    let config = args.resolve()?;

    logging::init(logging::level_from_verbosity(
        logging::parse_level(&config.log_level),
        args.verbose,
        args.quiet,
    ));

    let id = match (&config.device.id, config.device.simulation) {
        (Some(id), _) => id.clone(),
        (None, true) => "simulation".to_string(),
        (None, false) => bail!("--id is required unless --simulation is set"),
    };
    let options = DriverOptions {
        simulation: config.device.simulation,
        transport: Some(config.transport.clone()),
    };

    let driver = tokio::task::spawn_blocking(move || Driver::connect(&class, &id, options))
        .await
        .context("Driver construction panicked")??;

    let ip: IpAddr = config.server.bind.parse()?;
    let addr = SocketAddr::new(ip, config.server.port.unwrap_or(default_port));
    serve(name, driver, addr).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: RpcRequest = serde_json::from_str(r#"{"method": "get_identity"}"#).unwrap();
        assert!(request.args.is_empty());
        assert!(request.kwargs.is_empty());
    }

    #[test]
    fn test_request_values() {
        let request: RpcRequest =
            serde_json::from_str(r#"{"method": "m", "args": [0, 5.4, "x", true, null], "kwargs": {"b": 2}}"#)
                .unwrap();
        assert_eq!(
            request.args,
            vec![
                Value::Int(0),
                Value::Float(5.4),
                Value::Str("x".into()),
                Value::Bool(true),
                Value::None
            ]
        );
        assert_eq!(request.kwargs["b"], Value::Int(2));
    }

    #[test]
    fn test_response_shape() {
        let ok = serde_json::to_value(RpcResponse::Ok { ret: 1.into() }).unwrap();
        assert_eq!(ok, serde_json::json!({"status": "ok", "ret": 1}));
        let failed =
            serde_json::to_value(RpcResponse::from(DriverError::UnknownMethod("x".into()))).unwrap();
        assert_eq!(failed["status"], "failed");
        assert_eq!(failed["kind"], "unknown_method");
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = ControllerArgs::parse_from([
            "ctl",
            "--id",
            "COM3",
            "--simulation",
            "-p",
            "4000",
            "-vv",
        ]);
        let mut config = ControllerConfig::default();
        args.apply(&mut config);
        assert_eq!(config.device.id.as_deref(), Some("COM3"));
        assert!(config.device.simulation);
        assert_eq!(config.server.port, Some(4000));
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_id_rescues_empty_file_id() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[device]\nid = \"\"\n").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let without_id = ControllerArgs::parse_from(["ctl", "--config", &path]);
        assert!(matches!(
            without_id.resolve_with_prefix("SCPI_TEST_CLI_NONE_"),
            Err(ConfigError::Validation(_))
        ));

        let with_id = ControllerArgs::parse_from(["ctl", "--config", &path, "--id", "COM3"]);
        let config = with_id.resolve_with_prefix("SCPI_TEST_CLI_ID_").unwrap();
        assert_eq!(config.device.id.as_deref(), Some("COM3"));
    }
}
