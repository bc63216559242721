//! Local socket backend
//!
//! Unix domain sockets on Unix/macOS and named pipes on Windows, both through
//! the interprocess crate. Every accepted stream is a private channel to one
//! peer, so one listener serves any number of clients.
//!
//! A background task owns the OS listener. It hands each raw stream to its
//! own handshake task, and `accept` only returns peers that have already
//! presented the token, so a silent peer never holds up the ones behind it.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::{paths, Error, Result};

use super::handshake;
#[cfg(unix)]
use super::name_lock::NameLock;
use super::strategy::ConnectionStrategy;
use super::stream::StreamConn;
use super::transport::{Backend, BackendKind, Capabilities, Conn, Listener};

// Platform-specific imports and type aliases
#[cfg(unix)]
pub mod platform {
    pub use interprocess::local_socket::tokio::{
        prelude::*, Listener as SocketListener, Stream as SocketStream,
    };
    pub use interprocess::local_socket::{GenericFilePath, ListenerOptions, Name};
    pub use interprocess::os::unix::local_socket::ListenerOptionsExt;
}

#[cfg(windows)]
pub mod platform {
    pub use interprocess::local_socket::tokio::{
        prelude::*, Listener as SocketListener, Stream as SocketStream,
    };
    pub use interprocess::local_socket::{GenericNamespaced, ListenerOptions, Name};
}

use platform::*;

const CAPABILITIES: Capabilities = Capabilities {
    deadlines: true,
    multi_accept: true,
};

/// Handshaken peers that may wait for `accept`
const READY_BACKLOG: usize = 16;

/// Convert a resolved strategy path into an interprocess name
#[cfg(unix)]
fn socket_name(path: &Path) -> io::Result<Name<'_>> {
    path.to_fs_name::<GenericFilePath>()
}

#[cfg(windows)]
fn socket_name(path: &Path) -> io::Result<Name<'static>> {
    path.to_string_lossy()
        .into_owned()
        .to_ns_name::<GenericNamespaced>()
}

/// Bind an owner-only listener that unlinks its socket file when dropped
#[cfg(unix)]
fn bind(path: &Path) -> io::Result<SocketListener> {
    ListenerOptions::new()
        .name(socket_name(path)?)
        .reclaim_name(true)
        .mode(0o600)
        .create_tokio()
}

#[cfg(windows)]
fn bind(path: &Path) -> io::Result<SocketListener> {
    ListenerOptions::new()
        .name(socket_name(path)?)
        .reclaim_name(true)
        .create_tokio()
}

/// A socket file nobody is listening on, left behind by a crashed process
#[cfg(unix)]
async fn is_stale(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;

    let is_socket = std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false);
    if !is_socket {
        return false;
    }

    match socket_name(path) {
        Ok(name) => matches!(
            SocketStream::connect(name).await,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused
        ),
        Err(_) => false,
    }
}

#[cfg(windows)]
async fn is_stale(_path: &Path) -> bool {
    // Named pipes vanish with their last handle
    false
}

/// Named pipes leave nothing behind to reclaim, so there is nothing to lock
#[cfg(windows)]
struct NameLock;

#[cfg(windows)]
impl NameLock {
    async fn acquire(_path: &Path) -> Result<Self> {
        Ok(Self)
    }
}

/// Backend over interprocess local sockets
pub struct LocalSocketBackend;

#[async_trait]
impl Backend for LocalSocketBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalSocket
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    async fn listen(&self, strategy: &ConnectionStrategy) -> Result<Box<dyn Listener>> {
        let path = strategy.path();
        if let Some(dir) = path.parent() {
            paths::ensure_private_dir(dir).map_err(|e| Error::from_io(e, dir))?;
        }

        let listener = {
            let _name = NameLock::acquire(path).await?;
            match bind(path) {
                Ok(listener) => listener,
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    if !is_stale(path).await {
                        return Err(Error::PathInUse(strategy.display_name()));
                    }
                    tracing::warn!(path = %path.display(), "Removing stale socket");
                    std::fs::remove_file(path).map_err(|e| Error::from_io(e, path))?;
                    bind(path).map_err(|e| Error::from_io(e, path))?
                }
                Err(e) => return Err(Error::from_io(e, path)),
            }
        };

        tracing::info!(path = %path.display(), "Listening on local socket");
        Ok(Box::new(LocalListener::start(strategy, listener)))
    }

    async fn connect(&self, strategy: &ConnectionStrategy) -> Result<Box<dyn Conn>> {
        let path = strategy.path();
        tracing::debug!(path = %path.display(), "Connecting to local socket");

        let name = socket_name(path).map_err(|e| Error::from_io(e, path))?;
        let stream = SocketStream::connect(name)
            .await
            .map_err(|e| Error::from_io(e, path))?;

        let (recv, mut send) = stream.split();
        handshake::send(&mut send).await?;
        tracing::debug!(path = %path.display(), "Connected");

        Ok(Box::new(StreamConn::with_deadlines(
            strategy.display_name(),
            recv,
            send,
            CAPABILITIES.multi_accept,
        )))
    }
}

/// Listener over a bound local socket
pub struct LocalListener {
    name: String,
    path: PathBuf,
    ready: Mutex<mpsc::Receiver<Result<Box<dyn Conn>>>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
}

impl LocalListener {
    fn start(strategy: &ConnectionStrategy, listener: SocketListener) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(READY_BACKLOG);
        let closed = CancellationToken::new();

        let acceptor = Acceptor {
            name: strategy.display_name(),
            handshake_timeout: strategy.handshake_timeout(),
            ready: ready_tx,
            closed: closed.clone(),
        };

        Self {
            name: strategy.display_name(),
            path: strategy.path().to_path_buf(),
            ready: Mutex::new(ready_rx),
            acceptor: Mutex::new(Some(tokio::spawn(acceptor.run(listener)))),
            closed,
        }
    }
}

#[async_trait]
impl Listener for LocalListener {
    async fn accept(&self) -> Result<Box<dyn Conn>> {
        let mut ready = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(Error::Closed),
            ready = self.ready.lock() => ready,
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::Closed),
            next = ready.recv() => next.unwrap_or(Err(Error::Closed)),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }

        // Unlinking the socket must not interleave with another listener's
        // stale-socket reclaim on the same name
        let name = match NameLock::acquire(&self.path).await {
            Ok(name) => Some(name),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Closing without the name lock");
                None
            }
        };
        self.closed.cancel();

        // The accept task drops the OS listener, which unlinks the socket file
        let acceptor = self.acceptor.lock().await.take();
        if let Some(acceptor) = acceptor {
            if let Err(e) = acceptor.await {
                tracing::warn!(path = %self.path.display(), error = %e, "Accept task failed");
            }
        }
        drop(name);

        tracing::info!(path = %self.path.display(), "Listener closed");
        Ok(())
    }

    fn addr(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Background half of a `LocalListener`
#[derive(Clone)]
struct Acceptor {
    name: String,
    handshake_timeout: Duration,
    ready: mpsc::Sender<Result<Box<dyn Conn>>>,
    closed: CancellationToken,
}

impl Acceptor {
    /// Accept raw streams until closed, handshaking each in its own task
    async fn run(self, listener: SocketListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(stream) => {
                    tokio::spawn(self.clone().handshake(stream));
                }
                Err(e) => {
                    tracing::error!(addr = %self.name, error = %e, "Accept error");
                    self.deliver(Err(Error::Io(e))).await;
                    break;
                }
            }
        }

        drop(listener);
        tracing::debug!(addr = %self.name, "Accept loop stopped");
    }

    /// Admit a peer only once it has sent the exact token in time
    async fn handshake(self, stream: SocketStream) {
        let (mut recv, send) = stream.split();

        let checked = tokio::time::timeout(self.handshake_timeout, handshake::expect(&mut recv));
        let outcome = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return,
            outcome = checked => outcome,
        };

        match outcome {
            Ok(Ok(())) => {
                tracing::debug!(addr = %self.name, "Peer completed handshake");
                let conn: Box<dyn Conn> = Box::new(StreamConn::with_deadlines(
                    self.name.clone(),
                    recv,
                    send,
                    CAPABILITIES.multi_accept,
                ));
                self.deliver(Ok(conn)).await;
            }
            Ok(Err(e)) => {
                tracing::warn!(addr = %self.name, error = %e, "Rejected peer");
            }
            Err(_) => {
                tracing::warn!(
                    addr = %self.name,
                    timeout_ms = self.handshake_timeout.as_millis() as u64,
                    "Rejected peer: handshake timed out"
                );
            }
        }
    }

    /// Queue a result for `accept`, giving up once the listener closes
    async fn deliver(&self, result: Result<Box<dyn Conn>>) {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {}
            sent = self.ready.send(result) => {
                if sent.is_err() {
                    tracing::debug!(addr = %self.name, "Listener gone before peer was accepted");
                }
            }
        }
    }
}
