//! CLI-side client for talking to the daemon

use std::time::{Duration, Instant};

use crate::common::{Error, Result};

use super::strategy::ConnectionStrategy;
use super::transport::{self, Conn};

/// Client holding one connection to the daemon
pub struct DaemonClient {
    conn: Box<dyn Conn>,
}

impl DaemonClient {
    /// Connect to the running daemon
    pub async fn connect(strategy: &ConnectionStrategy) -> Result<Self> {
        let conn = transport::connect(strategy).await?;
        Ok(Self { conn })
    }

    /// Send `payload` and wait for the daemon to echo it back
    ///
    /// Uses a deadline where the backend supports one. Otherwise the wait is
    /// bounded by a watchdog that closes the connection.
    pub async fn echo(&self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let bounded = match self.conn.set_deadline(Some(Instant::now() + timeout)) {
            Ok(()) => true,
            Err(Error::UnsupportedOperation(_)) => false,
            Err(e) => return Err(e),
        };

        self.conn.write_all(payload).await?;

        let exchange = self.read_reply(payload.len());
        let reply = if bounded {
            exchange.await
        } else {
            match tokio::time::timeout(timeout, exchange).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.conn.close().await?;
                    Err(Error::DeadlineExceeded)
                }
            }
        };

        if bounded {
            self.conn.set_deadline(None)?;
        }
        reply
    }

    async fn read_reply(&self, len: usize) -> Result<Vec<u8>> {
        let mut reply = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            filled += self.conn.read(&mut reply[filled..]).await?;
        }
        Ok(reply)
    }

    pub fn conn(&self) -> &dyn Conn {
        self.conn.as_ref()
    }

    /// Close the connection
    pub async fn close(self) -> Result<()> {
        self.conn.close().await
    }
}
