//! Srv registry backend
//!
//! A server registry is a directory of already open channels to services.
//! `listen` creates a duplex pipe pair, keeps the server ends, and publishes
//! the client ends under the rendezvous name as a small JSON record:
//!
//! ```text
//! {"pid":4242,"channel":{"to_server":{"fd":7,"ino":91011},"to_client":{"fd":8,"ino":91012}}}
//! ```
//!
//! A client opens `/proc/<pid>/fd/<fd>` for each end, checks the inode, and
//! writes the handshake token. There is one channel per `listen`. The first
//! client to `flock` the record owns it until its connection closes; once the
//! peer has been accepted the record keeps only the pid, so the name stays
//! held but can no longer be opened.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;

use crate::common::{paths, Error, Result};

use super::handshake;
use super::name_lock::{self, NameLock};
use super::strategy::ConnectionStrategy;
use super::stream::StreamConn;
use super::transport::{Backend, BackendKind, Capabilities, Conn, Listener};

const CAPABILITIES: Capabilities = Capabilities {
    deadlines: false,
    multi_accept: false,
};

type SrvConn = StreamConn<pipe::Receiver, pipe::Sender>;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// One pipe end as seen through procfs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PipeEnd {
    fd: i32,
    ino: u64,
}

impl PipeEnd {
    fn of(end: &impl AsRawFd) -> io::Result<Self> {
        let fd = end.as_raw_fd();
        let meta = fs::metadata(format!("/proc/self/fd/{fd}"))?;
        Ok(Self { fd, ino: meta.ino() })
    }

    fn proc_path(&self, pid: u32) -> PathBuf {
        PathBuf::from(format!("/proc/{}/fd/{}", pid, self.fd))
    }

    /// Reopen this end from another process (or this one)
    fn open(&self, pid: u32, write: bool, name: &str) -> Result<File> {
        let path = self.proc_path(pid);
        let file = OpenOptions::new()
            .read(!write)
            .write(write)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| match Error::from_io(e, &path) {
                Error::NotFound(_) => Error::NotFound(name.to_string()),
                other => other,
            })?;

        // The fd number may have been recycled since the record was read
        let meta = file.metadata()?;
        if !meta.file_type().is_fifo() || meta.ino() != self.ino {
            return Err(Error::NotFound(name.to_string()));
        }
        Ok(file)
    }
}

/// Client ends of the channel, published in the record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PostedChannel {
    to_server: PipeEnd,
    to_client: PipeEnd,
}

/// Contents of a registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SrvRecord {
    pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<PostedChannel>,
}

impl SrvRecord {
    fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| Error::from_io(e, path))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write the record to a fresh private file next to `path`
    fn write_temp(&self, path: &Path) -> Result<PathBuf> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(
            ".{}.{}.{}.tmp",
            file_name,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)
            .map_err(|e| Error::from_io(e, &tmp))?;
        file.write_all(&serde_json::to_vec(self)?)?;
        file.sync_all()?;
        Ok(tmp)
    }
}

/// File identity of a published record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordId {
    dev: u64,
    ino: u64,
}

impl RecordId {
    fn of(path: &Path) -> io::Result<Self> {
        let meta = fs::symlink_metadata(path)?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

/// A published registry entry, removed again on close or drop
///
/// The entry remembers which file it published and only ever replaces or
/// removes that file, never a record someone else has since put at the path.
struct SrvEntry {
    path: PathBuf,
    id: RecordId,
}

impl SrvEntry {
    /// Atomically publish `record` at `path`
    ///
    /// The record is written to a temporary file and hard-linked into place,
    /// which fails if the name exists. A record whose owner has died is
    /// removed and the publish retried once. Callers hold the name lock.
    fn publish(path: &Path, record: &SrvRecord) -> Result<Self> {
        let tmp = record.write_temp(path)?;
        let linked = Self::link(&tmp, path).and_then(|()| {
            RecordId::of(&tmp).map_err(|e| Error::from_io(e, &tmp))
        });
        if let Err(e) = fs::remove_file(&tmp) {
            tracing::debug!(path = %tmp.display(), error = %e, "Failed to remove temporary record");
        }

        Ok(Self {
            path: path.to_path_buf(),
            id: linked?,
        })
    }

    fn link(tmp: &Path, path: &Path) -> Result<()> {
        let mut reclaimed = false;
        loop {
            match fs::hard_link(tmp, path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if reclaimed || !Self::is_stale(path) {
                        return Err(Error::PathInUse(path.display().to_string()));
                    }
                    tracing::warn!(path = %path.display(), "Removing stale srv record");
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(Error::from_io(e, path)),
                    }
                    reclaimed = true;
                }
                Err(e) => return Err(Error::from_io(e, path)),
            }
        }
    }

    /// Whether the record at `path` belongs to a process that no longer exists
    fn is_stale(path: &Path) -> bool {
        match SrvRecord::read(path) {
            Ok(record) => !process_alive(record.pid),
            // Vanished between link and read; let the retry find out
            Err(Error::NotFound(_)) => true,
            Err(_) => false,
        }
    }

    /// Whether the path still resolves to the record this entry published
    fn is_current(&self) -> bool {
        RecordId::of(&self.path).is_ok_and(|id| id == self.id)
    }

    /// Replace the record with one that only holds the name
    fn mark_claimed(&mut self, pid: u32) -> Result<()> {
        if !self.is_current() {
            return Err(Error::NotFound(self.path.display().to_string()));
        }

        let record = SrvRecord { pid, channel: None };
        let tmp = record.write_temp(&self.path)?;
        let id = RecordId::of(&tmp).map_err(|e| Error::from_io(e, &tmp));
        let renamed = id.and_then(|id| {
            fs::rename(&tmp, &self.path)
                .map(|()| id)
                .map_err(|e| Error::from_io(e, &self.path))
        });
        match renamed {
            Ok(id) => {
                self.id = id;
                Ok(())
            }
            Err(e) => {
                if let Err(e) = fs::remove_file(&tmp) {
                    tracing::debug!(path = %tmp.display(), error = %e, "Failed to remove temporary record");
                }
                Err(e)
            }
        }
    }
}

impl Drop for SrvEntry {
    fn drop(&mut self) {
        if !self.is_current() {
            tracing::debug!(path = %self.path.display(), "Srv record already replaced or removed");
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed srv record"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove srv record")
            }
        }
    }
}

/// Server side of a channel that has not been handed out yet
struct PendingChannel {
    inbound: pipe::Receiver,
    outbound: pipe::Sender,
    /// Client ends, kept open so procfs can reach them
    posted: (pipe::Sender, pipe::Receiver),
}

/// Backend over srv registry records and anonymous pipes
pub struct SrvBackend;

#[async_trait]
impl Backend for SrvBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Srv
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    async fn listen(&self, strategy: &ConnectionStrategy) -> Result<Box<dyn Listener>> {
        let path = strategy.path();
        let (to_server_tx, to_server_rx) = pipe::pipe()?;
        let (to_client_tx, to_client_rx) = pipe::pipe()?;

        let pid = std::process::id();
        let record = SrvRecord {
            pid,
            channel: Some(PostedChannel {
                to_server: PipeEnd::of(&to_server_tx)?,
                to_client: PipeEnd::of(&to_client_rx)?,
            }),
        };
        if let Some(dir) = path.parent() {
            paths::ensure_private_dir(dir).map_err(|e| Error::from_io(e, dir))?;
        }
        let entry = {
            let _name = NameLock::acquire(path).await?;
            SrvEntry::publish(path, &record)?
        };
        tracing::info!(path = %path.display(), pid, "Published srv record");

        Ok(Box::new(SrvListener {
            name: strategy.display_name(),
            pid,
            channel: tokio::sync::Mutex::new(Some(PendingChannel {
                inbound: to_server_rx,
                outbound: to_client_tx,
                posted: (to_server_tx, to_client_rx),
            })),
            entry: Mutex::new(Some(entry)),
            conn: Mutex::new(None),
            closed: CancellationToken::new(),
        }))
    }

    async fn connect(&self, strategy: &ConnectionStrategy) -> Result<Box<dyn Conn>> {
        let path = strategy.path();
        let name = strategy.display_name();
        tracing::debug!(path = %path.display(), "Connecting to srv record");

        // The channel admits one peer: whoever locks the record first
        let claim = File::open(path).map_err(|e| Error::from_io(e, path))?;
        match name_lock::try_exclusive(&claim) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::debug!(path = %path.display(), "Channel already claimed by another client");
                return Err(Error::NotFound(name));
            }
            Err(e) => return Err(Error::from_io(e, path)),
        }

        let record: SrvRecord = serde_json::from_reader(&claim)?;
        if !process_alive(record.pid) {
            return Err(Error::NotFound(name));
        }
        let channel = record.channel.ok_or_else(|| Error::NotFound(name.clone()))?;

        let tx = channel.to_server.open(record.pid, true, &name)?;
        let rx = channel.to_client.open(record.pid, false, &name)?;
        let mut tx = ClaimedSender {
            inner: pipe::Sender::from_file(tx)?,
            _claim: claim,
        };
        let rx = pipe::Receiver::from_file(rx)?;

        handshake::send(&mut tx).await?;
        tracing::debug!(path = %path.display(), pid = record.pid, "Connected");

        Ok(Box::new(StreamConn::without_deadlines(
            name,
            rx,
            tx,
            CAPABILITIES.multi_accept,
        )))
    }
}

/// Client write end, holding the record's claim lock for as long as it lives
struct ClaimedSender {
    inner: pipe::Sender,
    _claim: File,
}

impl AsyncWrite for ClaimedSender {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Listener owning one published srv record and its single channel
pub struct SrvListener {
    name: String,
    pid: u32,
    channel: tokio::sync::Mutex<Option<PendingChannel>>,
    entry: Mutex<Option<SrvEntry>>,
    /// The connection sharing this listener's channel, once accepted
    conn: Mutex<Option<Arc<SrvConn>>>,
    closed: CancellationToken,
}

#[async_trait]
impl Listener for SrvListener {
    async fn accept(&self) -> Result<Box<dyn Conn>> {
        let mut channel = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(Error::Closed),
            channel = self.channel.lock() => channel,
        };

        let Some(pending) = channel.as_mut() else {
            if self.closed.is_cancelled() {
                return Err(Error::Closed);
            }
            return Err(Error::UnsupportedOperation(
                "srv listener has already handed out its channel",
            ));
        };

        tracing::debug!(addr = %self.name, "Waiting for handshake");
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(Error::Closed),
            scanned = handshake::scan(&mut pending.inbound) => {
                scanned?;
            }
        }

        // The token is consumed and the peer is waiting, so the channel is
        // handed out even if the record cannot be rewritten. The peer's claim
        // lock still keeps other clients off the channel.
        if let Some(entry) = lock(&self.entry).as_mut() {
            if let Err(e) = entry.mark_claimed(self.pid) {
                tracing::warn!(addr = %self.name, error = %e, "Failed to mark srv record as claimed");
            }
        }
        let PendingChannel {
            inbound,
            outbound,
            posted,
        } = channel.take().ok_or(Error::Closed)?;
        // The peer holds its own copies now; ours would mask its close
        drop(posted);

        let conn = Arc::new(StreamConn::without_deadlines(
            self.name.clone(),
            inbound,
            outbound,
            CAPABILITIES.multi_accept,
        ));
        *lock(&self.conn) = Some(Arc::clone(&conn));

        tracing::info!(addr = %self.name, "Accepted peer");
        Ok(Box::new(conn))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        // Listener and connection share one channel
        let conn = lock(&self.conn).take();
        if let Some(conn) = conn {
            conn.close().await?;
        }
        self.channel.lock().await.take();
        lock(&self.entry).take();

        tracing::info!(addr = %self.name, "Listener closed");
        Ok(())
    }

    fn addr(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }
}
