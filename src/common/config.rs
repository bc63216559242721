//! Configuration file handling

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use super::paths::{self, config_path};
use super::Result;
use crate::ipc::BackendKind;

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Transport settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Transport settings shared by client and daemon
#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    /// Backend to use; the platform default when unset
    #[serde(default)]
    pub backend: Option<BackendKind>,

    /// Directory holding local sockets
    #[serde(default)]
    pub socket_dir: Option<PathBuf>,

    /// Root of the srv registry
    #[serde(default)]
    pub srv_root: Option<PathBuf>,

    /// How long an accepted peer may take to send the handshake token
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: None,
            socket_dir: None,
            srv_root: None,
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

fn default_handshake_timeout() -> u64 {
    5_000
}

impl TransportConfig {
    /// Handshake timeout as a duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Directory local sockets are resolved against
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(paths::runtime_dir)
    }

    /// Directory srv records are published in
    pub fn srv_root(&self) -> PathBuf {
        self.srv_root.clone().unwrap_or_else(paths::srv_root)
    }
}

/// Daemon configuration
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// Socket name the daemon listens on and clients connect to
    #[serde(default = "default_socket_name")]
    pub socket_name: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_name: default_socket_name(),
        }
    }
}

fn default_socket_name() -> String {
    paths::DEFAULT_SOCKET_NAME.to_string()
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    super::Error::FileRead {
                        path: path.display().to_string(),
                        error: e.to_string(),
                    }
                })?;
                return Self::from_toml(&content);
            }
        }
        Ok(Self::default())
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }
}
