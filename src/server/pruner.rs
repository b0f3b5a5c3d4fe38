//! Disconnect notifications and the task that prunes closed connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::clients::{ClientRegistry, Conn};
use crate::logging::LogThrottle;

/// A subsystem holding per-connection state that must be released when the
/// connection goes away.
pub trait DisconnectHook: Send + Sync {
    /// Called with the client registry lock held; must not block.
    fn on_disconnect(&self, conn: &Conn);
}

/// Producer side of the disconnect channel.
///
/// Publishing never waits. When the buffer is full the notification is
/// dropped and counted, so the data path is never stalled by a slow pruner.
#[derive(Clone)]
pub struct DisconnectNotifier {
    tx: mpsc::Sender<Conn>,
    dropped: Arc<AtomicU64>,
    throttle: Arc<LogThrottle>,
}

impl DisconnectNotifier {
    pub fn new(tx: mpsc::Sender<Conn>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            throttle: Arc::new(LogThrottle::new(Duration::from_secs(5))),
        }
    }

    pub fn publish(&self, conn: Conn) {
        match self.tx.try_send(conn) {
            Ok(()) => {}
            Err(TrySendError::Full(conn)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if self.throttle.should_log() {
                    warn!(
                        conn = %conn.id(),
                        peer = %conn.peer(),
                        dropped,
                        "Disconnect notification buffer full, notification lost"
                    );
                }
            }
            Err(TrySendError::Closed(conn)) => {
                debug!(conn = %conn.id(), "Disconnect pruner gone, notification discarded");
            }
        }
    }

    /// Notifications lost to a full buffer so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drain the disconnect channel until every sender is gone.
pub async fn run(
    mut rx: mpsc::Receiver<Conn>,
    clients: Arc<ClientRegistry>,
    hooks: Vec<Arc<dyn DisconnectHook>>,
) {
    while let Some(conn) = rx.recv().await {
        let removed = clients.remove_with(&conn, |conn| {
            for hook in &hooks {
                hook.on_disconnect(conn);
            }
        });
        if removed {
            info!(
                transport = %conn.transport(),
                peer = %conn.peer(),
                clients_connected = clients.connected(),
                "Client disconnected"
            );
        } else {
            debug!(conn = %conn.id(), "Disconnected client was not registered");
        }
    }

    debug!("Disconnect pruner stopped");
}
