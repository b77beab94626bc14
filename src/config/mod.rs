//! Configuration and credential storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_HEARTBEAT_SECS: u64 = 25;
const DEFAULT_RECONNECT_SECS: u64 = 3;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Environment variable that overrides `base_url`.
pub const BASE_URL_ENV: &str = "MARKETLINK_BASE_URL";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend origin; the `/api` namespace and realtime endpoint hang off it
    pub base_url: String,
    /// Explicit websocket endpoint (derived from `base_url` when unset)
    pub realtime_url: Option<String>,
    /// Liveness probe period while connected
    pub heartbeat_secs: u64,
    /// Fixed delay between reconnect attempts
    pub reconnect_secs: u64,
    /// Per-request timeout for the HTTP client
    pub request_timeout_secs: u64,
    /// Bound on the realtime websocket handshake
    pub connect_timeout_secs: u64,
    /// Stored access credential (JWT)
    pub auth_token: Option<String>,
    /// Stored refresh credential
    pub refresh_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            realtime_url: None,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            reconnect_secs: DEFAULT_RECONNECT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            auth_token: None,
            refresh_token: None,
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "marketlink", "marketlink")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location, applying env overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            if !base_url.is_empty() {
                config.base_url = base_url;
            }
        }
        Ok(config)
    }

    /// Load configuration from an explicit path. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains tokens)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}
