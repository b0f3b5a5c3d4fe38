//! Connected-client tracking.
//!
//! Every accepted connection gets a [`Connection`] handle. The
//! [`ClientRegistry`] holds the set of live handles together with the
//! connected-client gauge; both change only under the registry's lock.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Which listener a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Unix,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one accepted client connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    transport: Transport,
    peer: String,
}

/// Shared handle to a connection's identity.
pub type Conn = Arc<Connection>;

impl Connection {
    pub fn new(transport: Transport, peer: impl Into<String>) -> Conn {
        Arc::new(Self {
            id: ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)),
            transport,
            peer: peer.into(),
        })
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Remote address as reported by the listener.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[derive(Default)]
struct Clients {
    members: HashSet<ConnId>,
    connected: i64,
}

/// Set of currently connected clients plus the connected-client gauge.
///
/// Owned explicitly and shared through `Arc`; the lock is only ever held
/// for O(1) set and counter updates.
#[derive(Default)]
pub struct ClientRegistry {
    inner: Mutex<Clients>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Clients> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a freshly accepted connection and bump the gauge.
    pub fn add(&self, conn: &Conn) {
        let mut clients = self.lock();
        if clients.members.insert(conn.id()) {
            clients.connected += 1;
        }
    }

    /// Remove a connection, running `on_removed` while still holding the
    /// lock. Returns false if the connection was not registered, in which
    /// case neither the hook nor the gauge is touched.
    pub fn remove_with(&self, conn: &Conn, on_removed: impl FnOnce(&Conn)) -> bool {
        let mut clients = self.lock();
        if !clients.members.remove(&conn.id()) {
            return false;
        }
        on_removed(conn);
        clients.connected -= 1;
        true
    }

    /// Current value of the connected-clients gauge.
    pub fn connected(&self) -> i64 {
        self.lock().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_remove() {
        let registry = ClientRegistry::new();
        let a = Connection::new(Transport::Unix, "@");
        let b = Connection::new(Transport::Tcp, "127.0.0.1:1000");

        registry.add(&a);
        registry.add(&b);
        assert_eq!(registry.connected(), 2);

        assert!(registry.remove_with(&a, |_| {}));
        assert!(!registry.remove_with(&a, |_| {}));
        assert_eq!(registry.connected(), 1);
    }

    #[test]
    fn test_double_remove_never_goes_negative() {
        let registry = ClientRegistry::new();
        let conn = Connection::new(Transport::Tcp, "10.0.0.1:5000");
        registry.add(&conn);

        assert!(registry.remove_with(&conn, |_| {}));
        assert!(!registry.remove_with(&conn, |_| {}));
        assert_eq!(registry.connected(), 0);
    }

    #[test]
    fn test_hook_runs_only_for_members() {
        let registry = ClientRegistry::new();
        let conn = Connection::new(Transport::Unix, "@");
        let mut calls = 0;

        registry.remove_with(&conn, |_| calls += 1);
        assert_eq!(calls, 0);

        registry.add(&conn);
        registry.remove_with(&conn, |_| calls += 1);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_concurrent_accept_and_prune() {
        let registry = Arc::new(ClientRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let conns: Vec<_> = (0..100)
                        .map(|i| Connection::new(Transport::Tcp, format!("peer-{i}")))
                        .collect();
                    for conn in &conns {
                        registry.add(conn);
                    }
                    for conn in conns.iter().step_by(2) {
                        registry.remove_with(conn, |_| {});
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // 800 accepted, 400 pruned
        assert_eq!(registry.connected(), 400);
    }

    #[test]
    fn test_transport_labels() {
        assert_eq!(Transport::Tcp.to_string(), "tcp");
        assert_eq!(Transport::Unix.as_str(), "unix");
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Connection::new(Transport::Unix, "@");
        let b = Connection::new(Transport::Unix, "@");
        assert_ne!(a.id(), b.id());
    }
}
