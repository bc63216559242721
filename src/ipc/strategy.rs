//! Connection strategy: how to reach the daemon
//!
//! Client and daemon derive identical strategies from the same socket name
//! and configuration, which makes the resolved path the whole rendezvous
//! contract between the two processes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::{config::Config, paths};

use super::transport::BackendKind;

/// Immutable description of a rendezvous point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStrategy {
    backend: BackendKind,
    path: PathBuf,
    handshake_timeout: Duration,
}

impl ConnectionStrategy {
    /// Default time an accepted peer gets to present the handshake token
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Resolve a logical socket name with the detected backend
    pub fn resolve(name: &str, config: &Config) -> Self {
        Self::resolve_with(BackendKind::detect(config), name, config)
    }

    /// Resolve a logical socket name for a specific backend
    pub fn resolve_with(backend: BackendKind, name: &str, config: &Config) -> Self {
        let path = match backend {
            _ if paths::is_explicit_path(name) => PathBuf::from(name),
            BackendKind::LocalSocket => local_socket_path(name, config),
            BackendKind::Srv => config.transport.srv_root().join(name),
        };

        Self {
            backend,
            path,
            handshake_timeout: config.transport.handshake_timeout(),
        }
    }

    /// Strategy for an explicit, already resolved path
    pub fn at(backend: BackendKind, path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            path: path.into(),
            handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Same strategy with a different handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Rendezvous name for logs and `addr()`
    pub fn display_name(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(unix)]
fn local_socket_path(name: &str, config: &Config) -> PathBuf {
    config.transport.socket_dir().join(name)
}

#[cfg(windows)]
fn local_socket_path(name: &str, _config: &Config) -> PathBuf {
    // Named pipes live in a flat namespace; interprocess adds the \\.\pipe\ prefix
    PathBuf::from(name)
}
