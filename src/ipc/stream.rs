//! Connection over a pair of OS stream halves
//!
//! Both backends hand out a `StreamConn`: a read half and a write half, each
//! behind its own lock, plus a cancellation token that `close()` fires so a
//! blocked read or write returns immediately.

use std::future::Future;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::common::{Error, Result};

use super::transport::{Capabilities, Conn};

/// Per-direction deadlines, present only on backends with timer support
#[derive(Debug, Default)]
struct Deadlines {
    read: Mutex<Option<Instant>>,
    write: Mutex<Option<Instant>>,
}

impl Deadlines {
    fn get(slot: &Mutex<Option<Instant>>) -> Option<Instant> {
        *slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(slot: &Mutex<Option<Instant>>, deadline: Option<Instant>) {
        *slot.lock().unwrap_or_else(|e| e.into_inner()) = deadline;
    }
}

pub(crate) struct StreamConn<R, W> {
    addr: String,
    reader: tokio::sync::Mutex<Option<R>>,
    writer: tokio::sync::Mutex<Option<W>>,
    closed: CancellationToken,
    deadlines: Option<Deadlines>,
    multi_accept: bool,
}

impl<R, W> StreamConn<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    /// Connection whose backend can enforce deadlines
    pub(crate) fn with_deadlines(addr: String, reader: R, writer: W, multi_accept: bool) -> Self {
        Self::new(addr, reader, writer, Some(Deadlines::default()), multi_accept)
    }

    /// Connection whose backend has no timer support
    pub(crate) fn without_deadlines(addr: String, reader: R, writer: W, multi_accept: bool) -> Self {
        Self::new(addr, reader, writer, None, multi_accept)
    }

    fn new(
        addr: String,
        reader: R,
        writer: W,
        deadlines: Option<Deadlines>,
        multi_accept: bool,
    ) -> Self {
        Self {
            addr,
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            closed: CancellationToken::new(),
            deadlines,
            multi_accept,
        }
    }

    fn deadlines(&self) -> Result<&Deadlines> {
        self.deadlines
            .as_ref()
            .ok_or(Error::UnsupportedOperation("deadlines"))
    }

    /// Run `op` unless the connection closes or `deadline` passes first
    async fn guarded<T>(
        &self,
        deadline: Option<Instant>,
        op: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let bounded = async {
            match deadline {
                Some(at) => tokio::time::timeout_at(at.into(), op)
                    .await
                    .map_err(|_| Error::DeadlineExceeded)?,
                None => op.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::Closed),
            result = bounded => result,
        }
    }
}

#[async_trait]
impl<R, W> Conn for StreamConn<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = self.deadlines.as_ref().and_then(|d| Deadlines::get(&d.read));

        let n = self
            .guarded(deadline, async {
                let mut reader = self.reader.lock().await;
                let reader = reader.as_mut().ok_or(Error::Closed)?;
                Ok(reader.read(buf).await?)
            })
            .await?;

        if n == 0 {
            return Err(Error::EndOfStream);
        }
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        let deadline = self.deadlines.as_ref().and_then(|d| Deadlines::get(&d.write));

        self.guarded(deadline, async {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(Error::Closed)?;
            let n = writer.write(buf).await?;
            writer.flush().await?;
            Ok(n)
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        // Pending operations bail out on the token and release their locks
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(addr = %self.addr, error = %e, "Shutdown of write half failed");
            }
        }
        self.reader.lock().await.take();

        tracing::debug!(addr = %self.addr, "Connection closed");
        Ok(())
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        let deadlines = self.deadlines()?;
        Deadlines::set(&deadlines.read, deadline);
        Deadlines::set(&deadlines.write, deadline);
        Ok(())
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        Deadlines::set(&self.deadlines()?.read, deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        Deadlines::set(&self.deadlines()?.write, deadline);
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            deadlines: self.deadlines.is_some(),
            multi_accept: self.multi_accept,
        }
    }

    fn addr(&self) -> &str {
        &self.addr
    }
}
