//! Shared-port connection multiplexer.
//!
//! The multiplexer owns one TCP listener. For every new connection it peeks
//! at the first bytes without consuming them and hands the connection to the
//! first registered matcher that recognises them. Matching is retried each
//! time more bytes arrive, so a protocol with a short opening message is
//! routed without waiting for the longest prefix any matcher needs.
//! Connections nobody claims are closed.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::logging::LogThrottle;

/// Predicate over the first bytes of a connection.
pub type Matcher = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

type Accepted = (TcpStream, SocketAddr);

/// Connections waiting to be claimed by a [`MuxListener`].
const ROUTE_BACKLOG: usize = 128;

/// Delay between peeks while waiting for a short prefix to grow.
const SNIFF_RETRY: Duration = Duration::from_millis(10);

#[derive(Clone)]
struct Route {
    min_len: usize,
    matcher: Matcher,
    tx: mpsc::Sender<Accepted>,
}

/// Routes connections on a shared port by their leading bytes.
pub struct Mux {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    routes: Mutex<Vec<Route>>,
    sniff_timeout: Duration,
    shutdown: CancellationToken,
}

impl Mux {
    pub async fn bind(addr: SocketAddr, sniff_timeout: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            routes: Mutex::new(Vec::new()),
            sniff_timeout,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Claim connections whose first `min_len` bytes satisfy `matcher`.
    ///
    /// `matcher` sees everything peeked so far, at least `min_len` bytes.
    /// Matchers are tried in registration order each time the prefix grows.
    pub fn matcher<F>(&self, min_len: usize, matcher: F) -> MuxListener
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(ROUTE_BACKLOG);
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Route {
                min_len,
                matcher: Arc::new(matcher),
                tx,
            });

        MuxListener {
            rx,
            local_addr: self.local_addr,
        }
    }

    fn routes(&self) -> Vec<Route> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Accept and route connections until [`Mux::close`] is called.
    pub async fn serve(&self) -> io::Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| io::Error::other("multiplexer is already serving"))?;

        info!(addr = %self.local_addr, "Connection multiplexer listening");
        let throttle = LogThrottle::new(Duration::from_secs(1));

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        if throttle.should_log() {
                            warn!(error = %e, "Multiplexer failed to accept connection");
                        }
                        continue;
                    }
                },
            };

            let routes = self.routes();
            let sniff_timeout = self.sniff_timeout;
            tokio::spawn(async move { route(stream, peer, routes, sniff_timeout).await });
        }

        info!(addr = %self.local_addr, "Connection multiplexer stopped");
        Ok(())
    }

    /// Stop accepting and close the shared port. Every [`MuxListener`]
    /// reports closure once connections already being routed are delivered.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        // Covers close() before serve() ever ran.
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

async fn route(stream: TcpStream, peer: SocketAddr, routes: Vec<Route>, sniff_timeout: Duration) {
    let matched = match timeout(sniff_timeout, sniff(&stream, &routes)).await {
        Ok(Ok(matched)) => matched,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "Failed to read connection prefix");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "Timed out waiting for connection prefix");
            return;
        }
    };

    let Some(route) = matched.map(|i| &routes[i]) else {
        debug!(peer = %peer, "No protocol matched, dropping connection");
        return;
    };
    if route.tx.send((stream, peer)).await.is_err() {
        debug!(peer = %peer, "Matched listener is gone, dropping connection");
    }
}

/// Index of the first route that recognises `prefix`.
fn match_prefix(routes: &[Route], prefix: &[u8]) -> Option<usize> {
    routes
        .iter()
        .position(|r| prefix.len() >= r.min_len && (r.matcher)(prefix))
}

/// Peek until a route matches, or until the prefix is long enough for every
/// route and none did. `None` also covers a peer that closes early.
async fn sniff(stream: &TcpStream, routes: &[Route]) -> io::Result<Option<usize>> {
    let needed = routes.iter().map(|r| r.min_len).max().unwrap_or(0);
    let mut buf = vec![0u8; needed];
    let mut seen = 0;

    loop {
        let len = stream.peek(&mut buf).await?;
        if len == 0 {
            return Ok(None);
        }
        if len > seen {
            seen = len;
            if let Some(i) = match_prefix(routes, &buf[..len]) {
                return Ok(Some(i));
            }
            if len >= needed {
                return Ok(None);
            }
        }
        sleep(SNIFF_RETRY).await;
    }
}

/// Connections the multiplexer routed to one matcher.
pub struct MuxListener {
    rx: mpsc::Receiver<Accepted>,
    local_addr: SocketAddr,
}

impl MuxListener {
    /// Next matched connection, or `None` once the multiplexer is closed.
    pub async fn accept(&mut self) -> Option<(TcpStream, SocketAddr)> {
        self.rx.recv().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
