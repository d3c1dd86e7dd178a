//! Configuration for the server.
//!
//! Command-line arguments merged over an optional TOML file; CLI values
//! take precedence. The port is the one mandatory argument and is validated
//! into the unprivileged range before the process gets anywhere near a
//! socket.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "ascii-server")]
#[command(version = "0.1.0")]
#[command(
    about = "Opens a TCP socket and prints the received ASCII data to the console",
    long_about = None
)]
pub struct CliArgs {
    /// Port to listen on (1024-65535)
    #[arg(value_parser = clap::value_parser!(u16).range(1024..))]
    pub port: u16,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration.
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind the listener to
    #[serde(default = "default_host")]
    pub host: String,
    /// Pending-connection queue length
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum simultaneously connected clients
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Receive buffer size in bytes; also the largest single data callback
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            backlog: default_backlog(),
            max_clients: default_max_clients(),
            recv_buffer: default_recv_buffer(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> u32 {
    10
}

fn default_max_clients() -> usize {
    1024
}

fn default_recv_buffer() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub backlog: u32,
    pub max_clients: usize,
    pub recv_buffer: usize,
    pub verbose: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref path) = cli.config {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            port: cli.port,
            host: toml_config.server.host,
            backlog: toml_config.server.backlog,
            max_clients: toml_config.server.max_clients,
            recv_buffer: toml_config.server.recv_buffer,
            verbose: cli.verbose,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors.
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
    fn test_defaults() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.backlog, 10);
        assert_eq!(config.server.max_clients, 1024);
        assert_eq!(config.server.recv_buffer, 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            backlog = 32
            max_clients = 64
            recv_buffer = 4096

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.backlog, 32);
        assert_eq!(config.server.max_clients, 64);
        assert_eq!(config.server.recv_buffer, 4096);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_resolves_with_defaults() {
        let cli = CliArgs::try_parse_from(["ascii-server", "9000", "--verbose"]).unwrap();
        let config = Config::resolve(cli).unwrap();

        assert_eq!(config.port, 9000);
        assert!(config.verbose);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_privileged_port_is_rejected() {
        assert!(CliArgs::try_parse_from(["ascii-server", "80"]).is_err());
        assert!(CliArgs::try_parse_from(["ascii-server", "1023"]).is_err());
        assert!(CliArgs::try_parse_from(["ascii-server", "1024"]).is_ok());
    }

    #[test]
    fn test_port_is_mandatory() {
        assert!(CliArgs::try_parse_from(["ascii-server"]).is_err());
    }

    #[test]
    fn test_non_numeric_port_is_rejected() {
        let err = CliArgs::try_parse_from(["ascii-server", "not-a-port"]).unwrap_err();
        // The user-facing message must name the offending argument.
        assert!(err.to_string().contains("not-a-port"));
    }
}
