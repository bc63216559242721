//! Advisory locks on rendezvous names
//!
//! Publishing a name over a stale one is check, remove, then publish. Every
//! listener runs those steps while holding an exclusive `flock` on a sibling
//! `.<name>.lock` file, so two processes can never both decide the old name
//! is theirs to replace. The lock file itself is left in place: removing it
//! would let a third process lock a fresh inode while the first still holds
//! the old one.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::{Error, Result};

/// Pause between attempts while another process holds the lock
const RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Try to take an exclusive lock on `file` without blocking
///
/// Fails with `ErrorKind::WouldBlock` while another open file description
/// holds it. The lock is released when `file` is closed.
pub(crate) fn try_exclusive(file: &File) -> io::Result<()> {
    // SAFETY: the descriptor is owned by `file` and stays open for the call
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Held exclusive lock on one rendezvous name
#[derive(Debug)]
pub(crate) struct NameLock {
    _file: File,
}

impl NameLock {
    /// Lock file guarding `path`
    pub(crate) fn lock_path(path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{file_name}.lock"))
    }

    /// Wait until the name guarding `path` is ours
    ///
    /// The parent directory must already exist. Waiting yields to the
    /// runtime, so a holder on the same thread is never starved.
    pub(crate) async fn acquire(path: &Path) -> Result<Self> {
        let lock_path = Self::lock_path(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&lock_path)
            .map_err(|e| Error::from_io(e, &lock_path))?;

        loop {
            match try_exclusive(&file) {
                Ok(()) => return Ok(Self { _file: file }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(Error::from_io(e, &lock_path)),
            }
        }
    }
}
