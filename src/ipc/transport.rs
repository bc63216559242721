//! Cross-platform IPC transport layer
//!
//! One `Listener`/`Conn` contract over every local rendezvous primitive the
//! host offers. Exactly one `Backend` serves a given strategy, picked by
//! [`backend_for`].

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;

use crate::common::{config::Config, Error, Result};

use super::local_socket::LocalSocketBackend;
#[cfg(target_os = "linux")]
use super::srv::SrvBackend;
use super::strategy::ConnectionStrategy;

/// What a backend can do beyond plain byte transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Deadline setters take effect instead of failing with `UnsupportedOperation`
    pub deadlines: bool,
    /// One listener may accept any number of peers
    pub multi_accept: bool,
}

/// Available transport backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Unix domain sockets, or named pipes on Windows
    LocalSocket,
    /// Rendezvous pipes published in a srv registry directory
    Srv,
}

impl BackendKind {
    /// The backend used when nothing is configured
    pub fn platform_default() -> Self {
        BackendKind::LocalSocket
    }

    /// Pick the backend for this process
    pub fn detect(config: &Config) -> Self {
        config
            .transport
            .backend
            .unwrap_or_else(Self::platform_default)
    }

    /// Parse a backend name as used on the command line
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "local_socket" | "local-socket" | "socket" => Ok(BackendKind::LocalSocket),
            "srv" => Ok(BackendKind::Srv),
            other => Err(Error::Config(format!("unknown backend '{other}'"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::LocalSocket => "local_socket",
            BackendKind::Srv => "srv",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An established duplex byte channel to exactly one peer
///
/// Reads and writes go straight to the OS channel: no framing, no buffering.
/// Reads and writes use independent halves, so one task may read while
/// another writes.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Read available bytes into `buf`
    ///
    /// Returns `EndOfStream` once the peer has closed its end.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write bytes from `buf`, returning how many were written
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Close both halves; pending and later operations fail with `Closed`
    async fn close(&self) -> Result<()>;

    /// Set both read and write deadlines; `None` clears them
    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()>;

    fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()>;

    fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()>;

    fn capabilities(&self) -> Capabilities;

    /// Rendezvous name the connection was made through
    fn addr(&self) -> &str;

    /// Write all of `buf`
    async fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(Error::Io(std::io::ErrorKind::WriteZero.into()));
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// An OS rendezvous object accepting handshaken peers
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for a peer to complete the handshake
    ///
    /// Peers that never send the token are dropped after the strategy's
    /// handshake timeout without delaying peers that do.
    async fn accept(&self) -> Result<Box<dyn Conn>>;

    /// Release the rendezvous name; a blocked `accept` returns `Closed`
    async fn close(&self) -> Result<()>;

    fn addr(&self) -> &str;

    fn capabilities(&self) -> Capabilities;
}

/// One platform implementation of the `Listener`/`Conn` contract
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> Capabilities;

    /// Publish a listener at the strategy's path
    async fn listen(&self, strategy: &ConnectionStrategy) -> Result<Box<dyn Listener>>;

    /// Connect and send the handshake
    async fn connect(&self, strategy: &ConnectionStrategy) -> Result<Box<dyn Conn>>;
}

/// Get the backend implementing `kind` on this platform
pub fn backend_for(kind: BackendKind) -> Result<&'static dyn Backend> {
    match kind {
        BackendKind::LocalSocket => Ok(&LocalSocketBackend),
        #[cfg(target_os = "linux")]
        BackendKind::Srv => Ok(&SrvBackend),
        #[cfg(not(target_os = "linux"))]
        BackendKind::Srv => Err(Error::UnsupportedOperation(
            "srv backend is only available on Linux",
        )),
    }
}

/// Create a listener for incoming IPC connections
pub async fn listen(strategy: &ConnectionStrategy) -> Result<Box<dyn Listener>> {
    backend_for(strategy.backend())?.listen(strategy).await
}

/// Connect to the listener described by `strategy`
pub async fn connect(strategy: &ConnectionStrategy) -> Result<Box<dyn Conn>> {
    backend_for(strategy.backend())?.connect(strategy).await
}

#[async_trait]
impl<T: Conn + ?Sized> Conn for Arc<T> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        (**self).set_deadline(deadline)
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        (**self).set_read_deadline(deadline)
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        (**self).set_write_deadline(deadline)
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn addr(&self) -> &str {
        (**self).addr()
    }
}
