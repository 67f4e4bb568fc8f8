//! # Configuration Management
//!
//! This module handles loading and managing configuration for the kvlink
//! console and the pool relay. Configuration is loaded from TOML files and
//! includes settings for:
//! - Server address (host/port)
//! - Authentication and database selection
//! - Keepalive probing
//! - Pool sizing for the relay
//!
//! ## Example Configuration File (kvlink.toml)
//! ```toml
//! host = "localhost"
//! port = 6379
//! auth_token = "secret"
//! db_index = 2
//! keepalive_seconds = 300
//! pool_size = 4
//! ```
//!
//! Command-line flags override file values, which override the defaults.

use anyhow::Result;
use config::{Config as ConfigLib, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure shared by both binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hostname or IP of the upstream server (e.g., "localhost")
    #[serde(default = "default_host")]
    pub host: String,

    /// Port number of the upstream server (e.g., 6379)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional auth token sent via AUTH right after connecting
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Database index selected via SELECT after connecting; 0 means the
    /// server default and sends nothing
    #[serde(default)]
    pub db_index: u32,

    /// Keepalive probe interval in seconds; 0 disables the monitor
    #[serde(default = "default_keepalive_seconds")]
    pub keepalive_seconds: u64,

    /// Number of upstream connections the pool relay maintains
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_keepalive_seconds() -> u64 {
    300
}

fn default_pool_size() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_token: None,
            db_index: 0,
            keepalive_seconds: default_keepalive_seconds(),
            pool_size: default_pool_size(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    /// * `Result<Config>` - Parsed configuration or error if file is invalid
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ConfigLib::builder()
            .add_source(File::from(path).format(FileFormat::Toml))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    /// The upstream address in "host:port" form.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
