//! Configuration module for the reverb server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "reverb")]
#[command(author = "reverb authors")]
#[command(version = "0.1.0")]
#[command(about = "A reactor-based TCP server that transforms and echoes messages", long_about = None)]
pub struct CliArgs {
    /// Port to listen on
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Number of worker threads used for pooled dispatch
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Transformation applied to every message
    #[arg(short = 'p', long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Where connection work runs
    #[arg(short = 'd', long, value_enum)]
    pub dispatch: Option<DispatchMode>,

    /// Poll with a zero timeout instead of blocking for readiness
    #[arg(long)]
    pub busy_poll: bool,

    /// Per-connection read buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Maximum number of simultaneous connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Message transformation selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    /// Toggle the case of every ASCII letter.
    Transmogrify,
    /// Reverse every word, joining words with single spaces.
    Reverse,
}

/// Where the read/transform/write cycle of a connection runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Offload to the worker pool.
    Pooled,
    /// Run on the event loop thread.
    Inline,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_dispatch")]
    pub dispatch: DispatchMode,
    #[serde(default)]
    pub busy_poll: bool,
    /// Read buffer size per connection
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Events collected per poll call
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            workers: default_workers(),
            dispatch: default_dispatch(),
            busy_poll: false,
            buffer_size: default_buffer_size(),
            max_connections: default_max_connections(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Transformation configuration
#[derive(Debug, Deserialize)]
pub struct TransformConfig {
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolType,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_workers() -> usize {
    10
}

fn default_dispatch() -> DispatchMode {
    DispatchMode::Pooled
}

fn default_buffer_size() -> usize {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_events_capacity() -> usize {
    1024
}

fn default_protocol() -> ProtocolType {
    ProtocolType::Reverse
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub protocol: ProtocolType,
    pub dispatch: DispatchMode,
    pub busy_poll: bool,
    pub buffer_size: usize,
    pub max_connections: usize,
    pub events_capacity: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let file = TomlConfig::default();
        Config {
            host: file.server.host,
            port: 0,
            workers: file.server.workers,
            protocol: file.transform.protocol,
            dispatch: file.server.dispatch,
            busy_poll: file.server.busy_poll,
            buffer_size: file.server.buffer_size,
            max_connections: file.server.max_connections,
            events_capacity: file.server.events_capacity,
            log_level: file.logging.level,
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args against the optional TOML file.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(file.server.host),
            port: cli.port,
            workers: cli.workers.unwrap_or(file.server.workers).max(1),
            protocol: cli.protocol.unwrap_or(file.transform.protocol),
            dispatch: cli.dispatch.unwrap_or(file.server.dispatch),
            busy_poll: cli.busy_poll || file.server.busy_poll,
            buffer_size: cli.buffer_size.unwrap_or(file.server.buffer_size).max(1),
            max_connections: cli.max_connections.unwrap_or(file.server.max_connections),
            events_capacity: file.server.events_capacity.max(1),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
        }
    }

    /// Resolve `host:port` to the first matching socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let listen = format!("{}:{}", self.host, self.port);
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::InvalidAddress(listen.clone(), e))?
            .next()
            .ok_or_else(|| {
                ConfigError::InvalidAddress(
                    listen,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
                )
            })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid listen address '{0}': {1}")]
    InvalidAddress(String, #[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.workers, 10);
        assert_eq!(config.server.dispatch, DispatchMode::Pooled);
        assert_eq!(config.server.buffer_size, 1024);
        assert_eq!(config.transform.protocol, ProtocolType::Reverse);
        assert!(!config.server.busy_poll);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            workers = 4
            dispatch = "inline"
            busy_poll = true
            buffer_size = 256

            [transform]
            protocol = "transmogrify"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.server.dispatch, DispatchMode::Inline);
        assert!(config.server.busy_poll);
        assert_eq!(config.server.buffer_size, 256);
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.transform.protocol, ProtocolType::Transmogrify);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_port_is_required() {
        let err = CliArgs::try_parse_from(["reverb"]).unwrap_err();
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs::try_parse_from([
            "reverb",
            "9090",
            "--protocol",
            "transmogrify",
            "--dispatch",
            "inline",
            "-w",
            "3",
        ])
        .unwrap();

        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            host = "0.0.0.0"
            workers = 8
            "#,
        )
        .unwrap();

        let config = Config::merge(cli, file);
        assert_eq!(config.port, 9090);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.workers, 3);
        assert_eq!(config.protocol, ProtocolType::Transmogrify);
        assert_eq!(config.dispatch, DispatchMode::Inline);
        assert!(!config.busy_poll);
    }

    #[test]
    fn test_listen_addr() {
        let config = Config {
            port: 9090,
            ..Config::default()
        };
        let addr = config.listen_addr().unwrap();
        assert_eq!(addr, "127.0.0.1:9090".parse().unwrap());
    }
}
