//! Configuration module for the ping-pong server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Which poller backend the event loop runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Probe for the event-table backend, fall back to batching.
    #[default]
    Auto,
    /// Persistent event table (epoll).
    Table,
    /// Fixed-size readiness sets, polled in batches.
    Batch,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "ping-pong-poller")]
#[command(author = "ping-pong-poller authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded ping/pong server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:1337)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Poller backend
    #[arg(short = 'b', long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Maximum handles per call for the batch backend
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Timeout for each poll call in milliseconds (0 = non-blocking)
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Maximum bytes read per receive
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Poller-related configuration
#[derive(Debug, Deserialize)]
pub struct PollerConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Handle ceiling per call of the batch backend
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Poll timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            batch_size: default_batch_size(),
            timeout_ms: 0,
        }
    }
}

/// Request and reply tokens
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_request")]
    pub request: String,
    #[serde(default = "default_reply")]
    pub reply: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            request: default_request(),
            reply: default_reply(),
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
    "0.0.0.0:1337".to_string()
}

fn default_backlog() -> i32 {
    100
}

fn default_buffer_size() -> usize {
    1024
}

fn default_batch_size() -> usize {
    512
}

fn default_request() -> String {
    "ping".to_string()
}

fn default_reply() -> String {
    "pong".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub buffer_size: usize,
    pub backend: BackendKind,
    pub batch_size: usize,
    pub poll_timeout: Duration,
    pub request: String,
    pub reply: String,
    pub log_level: String,
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Self::resolve(CliArgs::empty(), TomlConfig::default())
            .expect("default configuration is valid")
    }
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

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen.clone()))?;

        let batch_size = cli.batch_size.unwrap_or(toml_config.poller.batch_size);
        if batch_size == 0 {
            return Err(ConfigError::ZeroSize("batch_size"));
        }

        let buffer_size = toml_config.server.buffer_size;
        if buffer_size == 0 {
            return Err(ConfigError::ZeroSize("buffer_size"));
        }

        Ok(Config {
            listen,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            buffer_size,
            backend: cli.backend.unwrap_or(toml_config.poller.backend),
            batch_size,
            poll_timeout: Duration::from_millis(
                cli.poll_timeout_ms.unwrap_or(toml_config.poller.timeout_ms),
            ),
            request: toml_config.protocol.request,
            reply: toml_config.protocol.reply,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

#[cfg(test)]
impl CliArgs {
    /// Arguments as if none were given on the command line.
    fn empty() -> Self {
        Self {
            config: None,
            listen: None,
            backend: None,
            batch_size: None,
            poll_timeout_ms: None,
            backlog: None,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
    ZeroSize(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidListen(addr) => {
                write!(f, "Invalid listen address '{}'", addr)
            }
            ConfigError::ZeroSize(field) => write!(f, "{} must be greater than zero", field),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen, "0.0.0.0:1337".parse().unwrap());
        assert_eq!(config.backlog, 100);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.backend, BackendKind::Auto);
        assert_eq!(config.batch_size, 512);
        assert_eq!(config.poll_timeout, Duration::ZERO);
        assert_eq!(config.request, "ping");
        assert_eq!(config.reply, "pong");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:4000"
            backlog = 16

            [poller]
            backend = "batch"
            batch_size = 64
            timeout_ms = 5

            [protocol]
            request = "hello"

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml_config.poller.backend, BackendKind::Batch);
        assert_eq!(toml_config.server.buffer_size, 1024);

        let config = Config::resolve(CliArgs::empty(), toml_config).unwrap();
        assert_eq!(config.listen, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.backlog, 16);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.poll_timeout, Duration::from_millis(5));
        assert_eq!(config.request, "hello");
        assert_eq!(config.reply, "pong");
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [poller]
            backend = "table"
            batch_size = 64
        "#,
        )
        .unwrap();

        let cli = CliArgs::try_parse_from([
            "ping-pong-poller",
            "--backend",
            "batch",
            "--batch-size",
            "8",
            "--listen",
            "127.0.0.1:9000",
        ])
        .unwrap();

        let config = Config::resolve(cli, toml_config).unwrap();
        assert_eq!(config.backend, BackendKind::Batch);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.listen.port(), 9000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let toml_config: TomlConfig = toml::from_str("[poller]\nbatch_size = 0\n").unwrap();
        assert!(matches!(
            Config::resolve(CliArgs::empty(), toml_config),
            Err(ConfigError::ZeroSize("batch_size"))
        ));

        let toml_config: TomlConfig = toml::from_str("[server]\nlisten = \"nowhere\"\n").unwrap();
        assert!(matches!(
            Config::resolve(CliArgs::empty(), toml_config),
            Err(ConfigError::InvalidListen(_))
        ));
    }
}
