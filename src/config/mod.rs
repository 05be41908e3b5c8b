//! Server configuration (`~/.agentwire/config.toml`).
//!
//! Every field has a default, so a missing file is a working configuration.
//! `AGENTWIRE_CONFIG` points at an alternate file; `AGENTWIRE_HOST`,
//! `AGENTWIRE_PORT`, and `AGENTWIRE_DB` override individual fields after
//! the file is read.

use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// HTTP/WebSocket listener (`[gateway]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Gateway port (default: 4076)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Allow binding to non-localhost addresses (default: false)
    #[serde(default)]
    pub allow_public_bind: bool,
}

/// Dispatch timeouts (`[broker]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BrokerConfig {
    /// Default bound on a request's single reply, in seconds (default: 30)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Default bound on a stream's first reply, in seconds (default: 60)
    #[serde(default = "default_stream_first_reply_timeout_secs")]
    pub stream_first_reply_timeout_secs: u64,
}

/// SQLite store location (`[storage]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    /// Database file path; `~` expands to the home directory
    /// (default: ~/.agentwire/agentwire.db)
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    4076
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_stream_first_reply_timeout_secs() -> u64 {
    60
}

fn default_db_path() -> String {
    "~/.agentwire/agentwire.db".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            allow_public_bind: false,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            stream_first_reply_timeout_secs: default_stream_first_reply_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_config_path() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".agentwire").join("config.toml"))
}

impl Config {
    /// Read the configuration file, falling back to defaults when it does
    /// not exist, then apply environment overrides.
    pub async fn load() -> Result<Self> {
        let path = match std::env::var("AGENTWIRE_CONFIG") {
            Ok(custom) => PathBuf::from(custom),
            Err(_) => default_config_path()?,
        };

        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("AGENTWIRE_HOST") {
            self.gateway.host = host;
        }
        if let Ok(port) = std::env::var("AGENTWIRE_PORT") {
            self.gateway.port = port
                .parse()
                .with_context(|| format!("Invalid AGENTWIRE_PORT: {port}"))?;
        }
        if let Ok(db_path) = std::env::var("AGENTWIRE_DB") {
            self.storage.db_path = db_path;
        }
        Ok(())
    }

    /// Store path with `~` expanded.
    pub fn resolved_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.storage.db_path).into_owned())
    }
}
