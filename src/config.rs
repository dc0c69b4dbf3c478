//! Configuration module for the grow-a-chat server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the chat server
#[derive(Parser, Debug, Default)]
#[command(name = "grow-a-chat")]
#[command(author = "grow-a-chat authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented broadcast chat server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of simultaneous client connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Maximum bytes in a single line, terminated or not (0 = unlimited)
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum simultaneous connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Readiness events handled per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Size of the scratch buffer used for each socket read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Reads served to one connection before moving on to the next
    #[serde(default = "default_reads_per_event")]
    pub reads_per_event: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            batch_size: default_batch_size(),
            read_buffer_size: default_read_buffer_size(),
            reads_per_event: default_reads_per_event(),
        }
    }
}

/// Chat behaviour configuration
#[derive(Debug, Deserialize)]
pub struct ChatConfig {
    /// Line sent to every client right after it connects
    #[serde(default = "default_welcome")]
    pub welcome: String,
    /// Cap on a single line, in bytes (0 = unlimited)
    #[serde(default)]
    pub max_line_length: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            welcome: default_welcome(),
            max_line_length: 0,
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
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_max_connections() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    1024
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_reads_per_event() -> usize {
    16
}

fn default_welcome() -> String {
    "Welcome to grow-a-chat!".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub batch_size: usize,
    pub read_buffer_size: usize,
    pub reads_per_event: usize,
    pub welcome: String,
    /// `None` leaves the incoming accumulator unbounded.
    pub max_line_length: Option<usize>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
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

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let max_line_length = cli
            .max_line_length
            .unwrap_or(toml_config.chat.max_line_length);

        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            batch_size: toml_config.server.batch_size.max(1),
            read_buffer_size: toml_config.server.read_buffer_size.max(1),
            reads_per_event: toml_config.server.reads_per_event.max(1),
            welcome: toml_config.chat.welcome,
            max_line_length: (max_line_length > 0).then_some(max_line_length),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5000);
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.reads_per_event, 16);
        assert_eq!(config.welcome, "Welcome to grow-a-chat!");
        assert_eq!(config.max_line_length, None);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 7000
            max_connections = 64
            batch_size = 128
            reads_per_event = 4

            [chat]
            welcome = "hi there"
            max_line_length = 8192

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.batch_size, 128);
        assert_eq!(config.server.read_buffer_size, 4096);
        assert_eq!(config.server.reads_per_event, 4);
        assert_eq!(config.chat.welcome, "hi there");
        assert_eq!(config.chat.max_line_length, 8192);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 7000

            [chat]
            max_line_length = 100

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let cli = CliArgs {
            port: Some(9000),
            max_line_length: Some(0),
            log_level: Some("trace".to_string()),
            ..CliArgs::default()
        };

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_line_length, None);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_cli_parsing() {
        let cli = CliArgs::try_parse_from(["grow-a-chat", "-p", "6000", "--host", "::1"]).unwrap();
        assert_eq!(cli.port, Some(6000));
        assert_eq!(cli.host.as_deref(), Some("::1"));
        assert!(cli.config.is_none());
    }
}
