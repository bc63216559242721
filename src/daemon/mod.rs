//! Daemon mode - long-running service behind the control socket
//!
//! The daemon here is a reference echo service: it exercises the transport
//! the way the real administrative API would, treating every established
//! connection as an opaque byte stream.

mod server;

pub use server::Daemon;

use crate::common::Result;
use crate::ipc::ConnectionStrategy;

/// Run in daemon mode
///
/// The daemon:
/// 1. Publishes a listener at the resolved rendezvous path
/// 2. Accepts handshaken peers and echoes their bytes back
/// 3. Re-listens when the backend serves one peer per listener
/// 4. Releases the rendezvous name on SIGINT/SIGTERM
pub async fn run(strategy: ConnectionStrategy) -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        backend = %strategy.backend(),
        path = %strategy.path().display(),
        "Starting ctlsock daemon"
    );

    Daemon::new(strategy).run().await
}
