//! Configuration module for chaton.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocols::chat::{max_message_len, DEFAULT_MAX_FIELD_LEN};
use crate::runtime::ConnectionLimits;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "chaton")]
#[command(version = "0.1.0")]
#[command(about = "Single-threaded chat server and client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Capacity of each per-connection buffer in bytes
    #[arg(short = 'b', long, global = true)]
    pub buffer_size: Option<usize>,

    /// Largest accepted sender or body length in bytes
    #[arg(long, global = true)]
    pub max_field_len: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub mode: ModeArgs,
}

/// Which side of the conversation to run
#[derive(Subcommand, Debug)]
pub enum ModeArgs {
    /// Run the chat server; reads INFO, SHUTDOWN and SHUTDOWNNOW from stdin
    Server {
        /// Port to listen on
        port: u16,

        /// Address to bind to
        #[arg(long)]
        host: Option<IpAddr>,

        /// Maximum number of simultaneous clients
        #[arg(short = 'm', long)]
        max_connections: Option<usize>,
    },
    /// Connect to a chat server; every stdin line is sent as a message
    Client {
        /// Name attached to every message sent
        login: String,

        /// Server host name or address
        host: String,

        /// Server port
        port: u16,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Maximum number of simultaneous clients
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
        }
    }
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeSection {
    /// Capacity of each per-connection buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Readiness events handled per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    /// Console lines that may wait for the event loop
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            events_capacity: default_events_capacity(),
            command_queue: default_command_queue(),
        }
    }
}

/// Wire protocol configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Largest accepted sender or body length
    #[serde(default = "default_max_field_len")]
    pub max_field_len: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_field_len: default_max_field_len(),
        }
    }
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

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_max_connections() -> usize {
    1024
}

fn default_backlog() -> i32 {
    1024
}

fn default_buffer_size() -> usize {
    4 * 1024 // holds the largest message at the default field cap
}

fn default_events_capacity() -> usize {
    1024
}

fn default_command_queue() -> usize {
    10
}

fn default_max_field_len() -> usize {
    DEFAULT_MAX_FIELD_LEN
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Settings shared by the server and client event loops.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub buffer_size: usize,
    pub max_field_len: usize,
    pub max_connections: usize,
    pub backlog: i32,
    pub events_capacity: usize,
    pub command_queue: usize,
}

impl RuntimeConfig {
    /// Per-connection sizing derived from these settings.
    pub fn limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            buffer_size: self.buffer_size,
            max_field_len: self.max_field_len,
        }
    }

    /// Check the settings can work together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_field_len == 0 || self.max_field_len > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_field_len must be in 1..={}",
                u32::MAX
            )));
        }
        // A message is never split across outbound flushes
        let largest = max_message_len(self.max_field_len);
        if self.buffer_size < largest {
            return Err(ConfigError::Invalid(format!(
                "buffer_size {} cannot hold a {largest}-byte message (max_field_len {})",
                self.buffer_size, self.max_field_len
            )));
        }
        if self.max_connections == 0 || self.events_capacity == 0 || self.command_queue == 0 {
            return Err(ConfigError::Invalid(
                "max_connections, events_capacity and command_queue must be non-zero".to_string(),
            ));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_field_len: default_max_field_len(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            events_capacity: default_events_capacity(),
            command_queue: default_command_queue(),
        }
    }
}

/// Role selected on the command line, with its resolved address.
#[derive(Debug, Clone)]
pub enum Mode {
    Server { listen: SocketAddr },
    Client { login: String, server: SocketAddr },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub runtime: RuntimeConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve parsed CLI arguments against the optional TOML file.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut runtime = RuntimeConfig {
            buffer_size: cli.buffer_size.unwrap_or(toml_config.runtime.buffer_size),
            max_field_len: cli
                .max_field_len
                .unwrap_or(toml_config.protocol.max_field_len),
            max_connections: toml_config.server.max_connections,
            backlog: toml_config.server.backlog,
            events_capacity: toml_config.runtime.events_capacity,
            command_queue: toml_config.runtime.command_queue,
        };

        let mode = match cli.mode {
            ModeArgs::Server {
                port,
                host,
                max_connections,
            } => {
                if let Some(max) = max_connections {
                    runtime.max_connections = max;
                }
                let host = host.unwrap_or(toml_config.server.host);
                Mode::Server {
                    listen: SocketAddr::new(host, port),
                }
            }
            ModeArgs::Client { login, host, port } => {
                if login.is_empty() || login.len() > runtime.max_field_len {
                    return Err(ConfigError::Invalid(format!(
                        "login must be 1..={} bytes",
                        runtime.max_field_len
                    )));
                }
                let server = (host.as_str(), port)
                    .to_socket_addrs()
                    .map_err(|e| ConfigError::Resolve(host.clone(), e))?
                    .next()
                    .ok_or_else(|| {
                        ConfigError::Resolve(
                            host.clone(),
                            std::io::Error::new(
                                std::io::ErrorKind::NotFound,
                                "no addresses found",
                            ),
                        )
                    })?;
                Mode::Client { login, server }
            }
        };

        runtime.validate()?;

        Ok(Config {
            mode,
            runtime,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Failed to resolve '{0}': {1}")]
    Resolve(String, #[source] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
