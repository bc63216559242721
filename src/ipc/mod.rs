//! IPC communication between CLI and daemon
//!
//! Uses Unix domain sockets on Unix/macOS and named pipes on Windows via the
//! interprocess crate, or srv registry pipes on Linux.

pub mod client;
pub mod handshake;
pub mod local_socket;
#[cfg(unix)]
mod name_lock;
#[cfg(target_os = "linux")]
pub mod srv;
pub mod strategy;
mod stream;
pub mod transport;

pub use client::DaemonClient;
pub use strategy::ConnectionStrategy;
pub use transport::{backend_for, connect, listen, Backend, BackendKind, Capabilities, Conn, Listener};
