//! ctlsock - local control-socket transport
//!
//! One `Listener`/`Conn` byte-stream contract for reaching a local daemon
//! over Unix domain sockets, Windows named pipes, or srv registry pipes.

pub mod cli;
pub mod commands;
pub mod common;
pub mod daemon;
pub mod ipc;

// Re-export commonly used types
pub use common::{Error, Result};
pub use ipc::{
    connect, listen, BackendKind, Capabilities, Conn, ConnectionStrategy, Listener,
};
