//! Error types for the control-socket transport
//!
//! The transport reports precise conditions only. Turning e.g. `NotFound`
//! into "start the daemon first" is left to the caller.

use std::io;
use std::path::Path;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the transport and its tooling
#[derive(Error, Debug)]
pub enum Error {
    // === Rendezvous Errors ===
    #[error("Rendezvous name '{0}' is held by another live listener")]
    PathInUse(String),

    #[error("No listener registered at '{0}'")]
    NotFound(String),

    #[error("Permission denied for '{0}'")]
    PermissionDenied(String),

    // === Handshake Errors ===
    #[error("Bad handshake: {0}")]
    BadHandshake(String),

    // === Connection Errors ===
    #[error("Operation not supported by this backend: {0}")]
    UnsupportedOperation(&'static str),

    #[error("Connection is closed")]
    Closed,

    #[error("Peer closed the connection")]
    EndOfStream,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Classify an OS error raised while operating on `path`
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        let path = path.display().to_string();
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => Self::NotFound(path),
            io::ErrorKind::AddrInUse | io::ErrorKind::AlreadyExists => Self::PathInUse(path),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            _ => Self::Io(err),
        }
    }

    /// Create a bad handshake error
    pub fn bad_handshake(reason: impl Into<String>) -> Self {
        Self::BadHandshake(reason.into())
    }

    /// Stable code for display and logs
    pub fn code(&self) -> &'static str {
        match self {
            Error::PathInUse(_) => "PATH_IN_USE",
            Error::NotFound(_) => "NOT_FOUND",
            Error::PermissionDenied(_) => "PERMISSION_DENIED",
            Error::BadHandshake(_) => "BAD_HANDSHAKE",
            Error::UnsupportedOperation(_) => "UNSUPPORTED_OPERATION",
            Error::Closed => "CLOSED",
            Error::EndOfStream => "END_OF_STREAM",
            Error::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG",
            Error::Io(_) | Error::FileRead { .. } => "IO_ERROR",
            Error::Json(_) => "INTERNAL_ERROR",
        }
    }
}
