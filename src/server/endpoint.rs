//! Local-transport endpoint: stale socket cleanup and a Unix listener that
//! unlinks its path when closed.

use std::future::poll_fn;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::Poll;

use tokio::net::{UnixListener, UnixStream, unix};
use tracing::{debug, warn};

use super::ServerError;

/// Remove a socket file left behind by an unclean shutdown.
///
/// Must only be called while holding the instance lock. A missing file is
/// not an error.
pub fn reclaim_stale(path: &Path) -> Result<(), ServerError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed stale socket file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ServerError::Reclaim {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Unix listener that removes its socket file on close or drop.
///
/// Closing drops the listening descriptor right away, so clients still
/// waiting in the backlog are refused rather than left hanging.
#[derive(Debug)]
pub struct LocalListener {
    listener: Mutex<Option<UnixListener>>,
    path: PathBuf,
}

impl LocalListener {
    pub fn bind(path: &Path) -> Result<Self, ServerError> {
        let listener = UnixListener::bind(path).map_err(|source| ServerError::Bind {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn listener(&self) -> MutexGuard<'_, Option<UnixListener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next client, or `None` once the listener is closed.
    ///
    /// An accept already waiting when `close()` runs is not woken; callers
    /// pair it with their own stop signal.
    pub async fn accept(&self) -> io::Result<Option<(UnixStream, unix::SocketAddr)>> {
        poll_fn(|cx| match self.listener().as_ref() {
            Some(listener) => listener.poll_accept(cx).map_ok(Some),
            None => Poll::Ready(Ok(None)),
        })
        .await
    }

    /// Close the listening descriptor and unlink the socket path.
    ///
    /// Idempotent: only the first call touches the path.
    pub fn close(&self) {
        let Some(listener) = self.listener().take() else {
            return;
        };
        drop(listener);

        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Unlinked socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to unlink socket file"),
        }
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reclaim_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(reclaim_stale(&dir.path().join("absent.socket")).is_ok());
    }

    #[test]
    fn test_reclaim_removes_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.socket");
        std::fs::write(&path, b"").unwrap();

        reclaim_stale(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_reclaim_refuses_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::create_dir(&path).unwrap();

        assert!(matches!(
            reclaim_stale(&path),
            Err(ServerError::Reclaim { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_unlinks_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.socket");

        let listener = LocalListener::bind(&path).unwrap();
        assert!(path.exists());

        listener.close();
        assert!(!path.exists());

        // Something else now owns the path; a second close or the drop
        // must leave it alone.
        std::fs::write(&path, b"").unwrap();
        listener.close();
        drop(listener);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_close_refuses_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backlog.socket");
        let listener = LocalListener::bind(&path).unwrap();

        // Connected but never accepted.
        let mut waiting = UnixStream::connect(&path).await.unwrap();
        listener.close();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            tokio::io::AsyncReadExt::read(&mut waiting, &mut buf),
        )
        .await
        .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        assert!(listener.accept().await.unwrap().is_none());
        assert!(UnixStream::connect(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_returns_client() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accept.socket");
        let listener = LocalListener::bind(&path).unwrap();

        let _client = UnixStream::connect(&path).await.unwrap();
        assert!(listener.accept().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bind_over_existing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.socket");
        std::fs::write(&path, b"").unwrap();

        assert!(matches!(
            LocalListener::bind(&path),
            Err(ServerError::Bind { .. })
        ));
    }
}
