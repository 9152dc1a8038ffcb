//! Configuration module for the edge-ack server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.
//!
//! The listen address, port and backlog are fixed constants and are not
//! exposed through either source.

use clap::Parser;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Port the listener binds to.
pub const PORT: u16 = 8080;

/// Maximum length of the queue of fully established connections awaiting
/// accept. Attempts beyond it are refused or retried by the client's stack.
pub const BACKLOG: i32 = 3;

/// Size of the per-loop scratch buffer used for every receive.
pub const BUFFER_SIZE: usize = 512;

/// Default number of readiness events returned by one poll.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Address the listener binds to: all IPv4 interfaces on [`PORT`].
pub fn listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, PORT))
}

/// Command-line arguments for the ack server
#[derive(Parser, Debug)]
#[command(name = "edge-ack")]
#[command(author = "edge-ack authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded edge-triggered TCP ack server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum number of readiness events handled per poll
    #[arg(short = 'b', long)]
    pub batch_size: Option<usize>,

    /// Send the acknowledgment with its trailing NUL byte ("Ack\n\0")
    #[arg(long)]
    pub ack_nul: bool,

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
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Readiness events per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

/// Ack protocol configuration
#[derive(Debug, Deserialize, Default)]
pub struct ProtocolConfig {
    /// Append the NUL terminator to every acknowledgment
    #[serde(default)]
    pub ack_nul: bool,
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

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub batch_size: usize,
    pub ack_nul: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            ack_nul: false,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let batch_size = cli.batch_size.unwrap_or(toml_config.server.batch_size);
        if batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1"));
        }

        Ok(Config {
            batch_size,
            ack_nul: cli.ack_nul || toml_config.protocol.ack_nul,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["edge-ack"];
        argv.extend_from_slice(args);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.batch_size, 20);
        assert!(!config.protocol.ack_nul);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_fixed_listen_address() {
        let addr = listen_addr();
        assert_eq!(addr.port(), 8080);
        assert!(addr.ip().is_unspecified());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            batch_size = 64

            [protocol]
            ack_nul = true

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.batch_size, 64);
        assert!(config.protocol.ack_nul);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str("[server]\nbatch_size = 64\n").unwrap();
        let config = Config::merge(cli(&["-b", "8", "--log-level", "trace"]), file).unwrap();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.log_level, "trace");
        assert!(!config.ack_nul);
    }

    #[test]
    fn test_file_values_used_without_cli() {
        let file: TomlConfig =
            toml::from_str("[protocol]\nack_nul = true\n[logging]\nlevel = \"warn\"\n").unwrap();
        let config = Config::merge(cli(&[]), file).unwrap();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(config.ack_nul);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = Config::merge(cli(&["--batch-size", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
