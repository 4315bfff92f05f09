//! Configuration for the embercache server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::error::Error;

/// Concurrency backend for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Single-threaded non-blocking reactor.
    #[default]
    St,
    /// One non-blocking reactor per worker thread.
    Mt,
    /// Single-threaded cooperative scheduler.
    Coop,
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "embercache")]
#[command(version = "0.1.0")]
#[command(about = "A memcached-compatible cache server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:11211)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum memory usage in bytes (e.g., 67108864 for 64MB)
    #[arg(short = 'm', long)]
    pub max_memory: Option<usize>,

    /// Number of worker threads for the mt backend (0 = number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Concurrency backend (st, mt or coop)
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub backend: Backend,
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backend: Backend::default(),
            workers: None,
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_max_memory")]
    pub max_memory: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_memory: default_max_memory(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    "127.0.0.1:11211".to_string()
}

fn default_max_memory() -> usize {
    64 * 1024 * 1024 // 64 MB
}

fn default_max_connections() -> usize {
    10_000
}

fn default_buffer_size() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backend: Backend,
    pub workers: usize,
    pub max_memory: usize,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backend: Backend::default(),
            workers: 0,
            max_memory: default_max_memory(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, Error> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, Error> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| Error::ConfigRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| Error::ConfigParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backend: cli.backend.unwrap_or(toml_config.server.backend),
            workers: cli.workers.or(toml_config.server.workers).unwrap_or(0),
            max_memory: cli.max_memory.unwrap_or(toml_config.storage.max_memory),
            max_connections: toml_config.server.max_connections,
            buffer_size: toml_config.server.buffer_size,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        // Fail early on an unparseable address.
        config.addr()?;
        Ok(config)
    }

    /// The resolved listen address.
    pub fn addr(&self) -> Result<SocketAddr, Error> {
        self.listen
            .parse()
            .map_err(|_| Error::InvalidAddress(self.listen.clone()))
    }
}
