//! Configuration module for vsock-relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. Invalid values are
//! replaced by defaults; each replacement is recorded in
//! [`Config::warnings`] so it can be logged once logging is up.

use crate::address::{EndpointAddress, CID_ANY, CID_HYPERVISOR, CID_PARENT, DEFAULT_PORT};
use crate::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::transport::TransportType;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_WORKERS: usize = 100;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "vsock-relay")]
#[command(author = "vsock-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "Relays line-delimited requests between a host and its guest over vsock", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Transport to use (overrides the config file)
    #[arg(long, value_enum, global = true)]
    pub transport: Option<TransportType>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// What to run
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Accept connections and answer requests (host side)
    Serve {
        /// Context id to listen on (defaults to any)
        #[arg(long)]
        cid: Option<u32>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u32>,
        /// Number of workers, which is also the concurrent session limit
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Send lines from stdin and print the responses (guest side)
    Connect {
        /// Context id of the host
        #[arg(long)]
        cid: Option<u32>,
        /// Port the host listens on
        #[arg(short, long)]
        port: Option<u32>,
    },
    /// Print the local context id
    Cid,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[server]` table. Timeouts are in seconds.
#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub transport: Option<TransportType>,
    pub listen_cid: Option<i64>,
    pub port: Option<i64>,
    pub workers: Option<i64>,
    pub read_timeout: Option<i64>,
    pub write_timeout: Option<i64>,
    pub max_frame_length: Option<i64>,
}

/// `[client]` table. Timeouts are in seconds.
#[derive(Debug, Deserialize, Default)]
pub struct ClientSection {
    pub transport: Option<TransportType>,
    pub cid: Option<i64>,
    pub port: Option<i64>,
    pub connect_timeout: Option<i64>,
    pub read_timeout: Option<i64>,
    pub write_timeout: Option<i64>,
    pub max_frame_length: Option<i64>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: TransportType,
    pub listen: EndpointAddress,
    pub workers: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_length: usize,
}

/// Resolved client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportType,
    pub target: EndpointAddress,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_length: usize,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub log_level: String,
    /// Values that were invalid and replaced by defaults.
    pub warnings: Vec<String>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::resolve(cli, toml_config))
    }

    /// Merge CLI args over TOML values and apply defaults.
    pub fn resolve(cli: CliArgs, file: TomlConfig) -> Self {
        let mut resolver = Resolver::default();

        let (serve_cid, serve_port, serve_workers) = match cli.command {
            Command::Serve { cid, port, workers } => (cid, port, workers),
            _ => (None, None, None),
        };
        let (connect_cid, connect_port) = match cli.command {
            Command::Connect { cid, port } => (cid, port),
            _ => (None, None),
        };

        let listen_cid = resolver.cid(
            "server.listen_cid",
            serve_cid.map(i64::from).or(file.server.listen_cid),
            CID_ANY,
            i64::from(CID_HYPERVISOR),
        );
        let server = ServerConfig {
            transport: cli
                .transport
                .or(file.server.transport)
                .unwrap_or(TransportType::Vsock),
            listen: resolver.address(
                "server.port",
                listen_cid,
                serve_port.map(i64::from).or(file.server.port),
            ),
            workers: resolver.positive(
                "server.workers",
                serve_workers
                    .map(|w| i64::try_from(w).unwrap_or(i64::MAX))
                    .or(file.server.workers),
                DEFAULT_WORKERS,
            ),
            read_timeout: resolver.secs(
                "server.read_timeout",
                file.server.read_timeout,
                DEFAULT_READ_TIMEOUT,
            ),
            write_timeout: resolver.secs(
                "server.write_timeout",
                file.server.write_timeout,
                DEFAULT_WRITE_TIMEOUT,
            ),
            max_frame_length: resolver.positive(
                "server.max_frame_length",
                file.server.max_frame_length,
                DEFAULT_MAX_FRAME_LENGTH,
            ),
        };

        // A guest never dials the hypervisor.
        let target_cid = resolver.cid(
            "client.cid",
            connect_cid.map(i64::from).or(file.client.cid),
            CID_PARENT,
            i64::from(CID_HYPERVISOR) + 1,
        );
        let client = ClientConfig {
            transport: cli
                .transport
                .or(file.client.transport)
                .unwrap_or(TransportType::Vsock),
            target: resolver.address(
                "client.port",
                target_cid,
                connect_port.map(i64::from).or(file.client.port),
            ),
            connect_timeout: resolver.secs(
                "client.connect_timeout",
                file.client.connect_timeout,
                DEFAULT_CONNECT_TIMEOUT,
            ),
            read_timeout: resolver.secs(
                "client.read_timeout",
                file.client.read_timeout,
                DEFAULT_READ_TIMEOUT,
            ),
            write_timeout: resolver.secs(
                "client.write_timeout",
                file.client.write_timeout,
                DEFAULT_WRITE_TIMEOUT,
            ),
            max_frame_length: resolver.positive(
                "client.max_frame_length",
                file.client.max_frame_length,
                DEFAULT_MAX_FRAME_LENGTH,
            ),
        };

        Config {
            command: cli.command,
            server,
            client,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
            warnings: resolver.warnings,
        }
    }
}

/// Applies defaults and remembers what it replaced.
#[derive(Default)]
struct Resolver {
    warnings: Vec<String>,
}

impl Resolver {
    fn replaced(&mut self, field: &str, value: i64, default: impl std::fmt::Display) {
        self.warnings
            .push(format!("{field} = {value} is invalid, using default {default}"));
    }

    fn cid(&mut self, field: &str, value: Option<i64>, default: u32, min: i64) -> u32 {
        match value {
            None => default,
            Some(c) if c >= min && c <= i64::from(u32::MAX) => c as u32,
            Some(c) => {
                self.replaced(field, c, default);
                default
            }
        }
    }

    fn positive(&mut self, field: &str, value: Option<i64>, default: usize) -> usize {
        match value.map(|v| (v, usize::try_from(v))) {
            None => default,
            Some((_, Ok(v))) if v > 0 => v,
            Some((v, _)) => {
                self.replaced(field, v, default);
                default
            }
        }
    }

    fn secs(&mut self, field: &str, value: Option<i64>, default: Duration) -> Duration {
        match value {
            None => default,
            Some(s) if s > 0 => Duration::from_secs(s as u64),
            Some(s) => {
                self.replaced(field, s, format!("{}s", default.as_secs()));
                default
            }
        }
    }

    fn address(&mut self, field: &str, cid: u32, port: Option<i64>) -> EndpointAddress {
        let Some(requested) = port else {
            return EndpointAddress::with_default_port(cid);
        };
        match u32::try_from(requested)
            .ok()
            .and_then(|p| EndpointAddress::new(cid, p).ok())
        {
            Some(addr) => addr,
            None => {
                self.replaced(field, requested, DEFAULT_PORT);
                EndpointAddress::with_default_port(cid)
            }
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
