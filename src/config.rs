//! Configuration module for the proxy-drain demo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use proxy_drain::{ListenerOptions, DEFAULT_PEEK_BUFFER_SIZE};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "proxy-drain")]
#[command(version = "0.1.0")]
#[command(about = "Echo server behind a PROXY-aware, draining listener", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Parse a PROXY protocol header on every accepted connection
    #[arg(long)]
    pub proxy_protocol: bool,

    /// TCP keep-alive period in seconds (0 = leave socket default)
    #[arg(long)]
    pub keepalive_secs: Option<u64>,

    /// Give up waiting for a PROXY header after this many milliseconds (0 = wait forever)
    #[arg(long)]
    pub header_timeout_ms: Option<u64>,

    /// Seconds to wait for open connections on shutdown (0 = wait forever)
    #[arg(short = 'd', long)]
    pub drain_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub drain: DrainConfig,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Parse PROXY protocol headers
    #[serde(default)]
    pub proxy_protocol: bool,
    /// TCP keep-alive period in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Header read timeout in milliseconds
    #[serde(default)]
    pub header_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            proxy_protocol: false,
            keepalive_secs: default_keepalive_secs(),
            header_timeout_ms: 0,
        }
    }
}

/// Shutdown configuration
#[derive(Debug, Deserialize)]
pub struct DrainConfig {
    /// Seconds to wait for connections to finish
    #[serde(default = "default_drain_timeout")]
    pub timeout_secs: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_drain_timeout(),
        }
    }
}

/// Peek buffer configuration
#[derive(Debug, Deserialize)]
pub struct BufferConfig {
    /// Size of each peek buffer in bytes
    #[serde(default = "default_peek_buffer_size")]
    pub peek_buffer_size: usize,
    /// Idle buffers kept for reuse
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            peek_buffer_size: default_peek_buffer_size(),
            max_idle: default_max_idle(),
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

fn default_listen() -> String {
    "127.0.0.1:7000".to_string()
}

fn default_keepalive_secs() -> u64 {
    180
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_peek_buffer_size() -> usize {
    DEFAULT_PEEK_BUFFER_SIZE
}

fn default_max_idle() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub proxy_protocol: bool,
    pub keepalive: Option<Duration>,
    pub header_timeout: Option<Duration>,
    pub drain_timeout: Option<Duration>,
    pub peek_buffer_size: usize,
    pub max_idle_buffers: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
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

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen.clone()))?;

        let keepalive_secs = cli
            .keepalive_secs
            .unwrap_or(toml_config.server.keepalive_secs);
        let header_timeout_ms = cli
            .header_timeout_ms
            .unwrap_or(toml_config.server.header_timeout_ms);
        let drain_timeout_secs = cli.drain_timeout.unwrap_or(toml_config.drain.timeout_secs);

        Ok(Config {
            listen,
            proxy_protocol: cli.proxy_protocol || toml_config.server.proxy_protocol,
            keepalive: nonzero(keepalive_secs).map(Duration::from_secs),
            header_timeout: nonzero(header_timeout_ms).map(Duration::from_millis),
            drain_timeout: nonzero(drain_timeout_secs).map(Duration::from_secs),
            peek_buffer_size: toml_config.buffers.peek_buffer_size,
            max_idle_buffers: toml_config.buffers.max_idle,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }

    /// Options for the listener built from this configuration.
    pub fn listener_options(&self) -> ListenerOptions {
        ListenerOptions {
            proxy_protocol: self.proxy_protocol,
            keepalive: self.keepalive,
            header_timeout: self.header_timeout,
            peek_buffer_size: self.peek_buffer_size,
            max_idle_buffers: self.max_idle_buffers,
        }
    }
}

fn nonzero(value: u64) -> Option<u64> {
    (value > 0).then_some(value)
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
    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),
}
