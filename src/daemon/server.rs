//! Daemon server - listener and accept loop

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::common::{Error, Result};
use crate::ipc::{backend_for, Conn, ConnectionStrategy, Listener};

/// Size of the echo buffer per connection
const ECHO_BUFFER: usize = 8 * 1024;

/// Main daemon server
pub struct Daemon {
    /// Where to listen
    strategy: ConnectionStrategy,
    /// Connections accepted so far, used as session ids
    sessions: u64,
}

impl Daemon {
    /// Create a new daemon instance
    pub fn new(strategy: ConnectionStrategy) -> Self {
        Self {
            strategy,
            sessions: 0,
        }
    }

    /// Run until SIGINT/SIGTERM
    pub async fn run(&mut self) -> Result<()> {
        let shutdown = CancellationToken::new();
        watch_signals(shutdown.clone())?;
        self.run_until(shutdown).await
    }

    /// Run the daemon main loop until `shutdown` fires
    ///
    /// Backends that accept one peer per listener get a fresh listener after
    /// each session.
    pub async fn run_until(&mut self, shutdown: CancellationToken) -> Result<()> {
        let backend = backend_for(self.strategy.backend())?;

        loop {
            let listener = backend.listen(&self.strategy).await?;
            tracing::info!(
                addr = listener.addr(),
                backend = %backend.kind(),
                "Daemon listening"
            );

            let served = self.serve(listener.as_ref(), &shutdown).await;
            listener.close().await?;

            if !served? {
                break;
            }
        }

        tracing::info!("Daemon shutdown complete");
        Ok(())
    }

    /// Accept peers until shutdown
    ///
    /// Returns `true` when the listener is spent and must be re-created.
    async fn serve(&mut self, listener: &dyn Listener, shutdown: &CancellationToken) -> Result<bool> {
        let multi_accept = listener.capabilities().multi_accept;

        loop {
            let conn = tokio::select! {
                _ = shutdown.cancelled() => return Ok(false),
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(Error::Closed) => return Ok(false),
                    Err(e) => {
                        tracing::error!(error = %e, "Accept error");
                        return Err(e);
                    }
                },
            };

            self.sessions += 1;
            let span = tracing::info_span!("session", id = self.sessions);

            if multi_accept {
                tokio::spawn(handle_client(conn).instrument(span));
                continue;
            }

            // The channel belongs to the listener; serve it in place
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(false),
                _ = handle_client(conn).instrument(span) => {}
            }
            return Ok(true);
        }
    }
}

/// Echo everything a client sends until it disconnects
async fn handle_client(conn: Box<dyn Conn>) {
    tracing::debug!(addr = conn.addr(), "Client connected");
    let mut buf = vec![0u8; ECHO_BUFFER];

    loop {
        let n = match conn.read(&mut buf).await {
            Ok(n) => n,
            Err(Error::EndOfStream) | Err(Error::Closed) => {
                tracing::debug!("Client disconnected");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Error reading from client");
                break;
            }
        };

        if let Err(e) = conn.write_all(&buf[..n]).await {
            tracing::warn!(error = %e, "Error writing to client");
            break;
        }
    }

    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "Error closing client connection");
    }
}

/// Cancel `shutdown` on SIGINT/SIGTERM (Ctrl+C on Windows)
fn watch_signals(shutdown: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down gracefully"),
                _ = sigint.recv() => tracing::info!("Received SIGINT (Ctrl+C), shutting down gracefully"),
            }
            shutdown.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Received Ctrl+C, shutting down gracefully"),
                Err(e) => {
                    tracing::warn!(error = %e, "Could not listen for Ctrl+C");
                    return;
                }
            }
            shutdown.cancel();
        });
    }

    Ok(())
}
