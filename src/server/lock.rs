//! Single-instance lock.
//!
//! The server takes an exclusive, non-blocking `flock(2)` on a well-known
//! file before it touches the local socket path. A second instance fails
//! immediately instead of waiting.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

use super::ServerError;

/// Holds the exclusive lock for as long as it lives.
pub struct LockGuard {
    lock: Flock<File>,
    path: PathBuf,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("path", &self.path).finish()
    }
}

impl LockGuard {
    /// Open (creating if needed) `path` and lock it without blocking.
    pub fn acquire(path: &Path) -> Result<Self, ServerError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o666)
            .open(path)
            .map_err(|source| ServerError::LockOpen {
                path: path.to_path_buf(),
                source,
            })?;

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            ServerError::LockHeld {
                path: path.to_path_buf(),
                source: errno,
            }
        })?;

        debug!(path = %path.display(), "Acquired instance lock");
        Ok(Self {
            lock,
            path: path.to_path_buf(),
        })
    }

    /// Unlock and close the lock file.
    pub fn release(self) {
        match self.lock.unlock() {
            Ok(file) => {
                drop(file);
                debug!(path = %self.path.display(), "Released instance lock");
            }
            Err((_, errno)) => {
                // Closing the descriptor drops the lock regardless.
                warn!(path = %self.path.display(), error = %errno, "Failed to unlock lock file");
            }
        }
    }
}
