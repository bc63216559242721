//! Cross-platform rendezvous and configuration paths
//!
//! Unix/macOS: sockets and srv records live under $XDG_RUNTIME_DIR or /tmp
//! Windows: named pipes live in the pipe namespace, no directory needed

use std::io;
use std::path::{Path, PathBuf};

/// Application name used for directories and the default socket name
pub const APP_NAME: &str = "ctlsock";

/// Default socket name the daemon listens on
pub const DEFAULT_SOCKET_NAME: &str = "ctlsockd.sock";

/// Get the per-user runtime directory holding rendezvous objects
///
/// - Unix: `$XDG_RUNTIME_DIR/ctlsock` or `/tmp/ctlsock-<uid>`
/// - Windows: empty, the pipe namespace is flat
#[cfg(unix)]
pub fn runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join(APP_NAME);
        }
    }

    // Fallback to /tmp with uid for security
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
}

#[cfg(windows)]
pub fn runtime_dir() -> PathBuf {
    PathBuf::new()
}

/// Default root of the srv registry
pub fn srv_root() -> PathBuf {
    runtime_dir().join("srv")
}

/// Whether a socket name should be taken as a path rather than a bare name
pub fn is_explicit_path(name: &str) -> bool {
    name.contains('/') || name.contains(std::path::MAIN_SEPARATOR)
}

/// Ensure a rendezvous directory exists with owner-only permissions
///
/// On Unix, creates the directory with mode 0700
#[cfg(unix)]
pub fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}

#[cfg(windows)]
pub fn ensure_private_dir(_dir: &Path) -> io::Result<()> {
    // Named pipes don't need a directory on Windows
    Ok(())
}

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/ctlsock/`
/// - macOS: `~/Library/Application Support/ctlsock/`
/// - Windows: `%APPDATA%\ctlsock\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.data_dir().join("logs"))
}
