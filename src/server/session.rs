//! Accept loops and per-connection sessions.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::clients::{ClientRegistry, Conn, Connection, Transport};
use super::endpoint::LocalListener;
use super::mux::MuxListener;
use super::program::{Dispatcher, ProgramRegistry};
use super::pruner::DisconnectNotifier;
use crate::logging::LogThrottle;
use crate::rpc::codec::{BoxedStream, ServerCodec};

/// A source of client connections.
#[async_trait]
pub trait Listener: Send {
    fn transport(&self) -> Transport;

    fn local_addr(&self) -> String;

    /// Wait for the next connection. `Ok(None)` means the listener has been
    /// closed for good.
    async fn accept(&mut self) -> io::Result<Option<(BoxedStream, String)>>;
}

#[async_trait]
impl Listener for Arc<LocalListener> {
    fn transport(&self) -> Transport {
        Transport::Unix
    }

    fn local_addr(&self) -> String {
        self.path().display().to_string()
    }

    async fn accept(&mut self) -> io::Result<Option<(BoxedStream, String)>> {
        let Some((stream, addr)) = LocalListener::accept(&**self).await? else {
            return Ok(None);
        };
        let peer = addr
            .as_pathname()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "@".to_string());
        Ok(Some((Box::new(stream), peer)))
    }
}

#[async_trait]
impl Listener for MuxListener {
    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn local_addr(&self) -> String {
        MuxListener::local_addr(self).to_string()
    }

    async fn accept(&mut self) -> io::Result<Option<(BoxedStream, String)>> {
        Ok(MuxListener::accept(self)
            .await
            .map(|(stream, peer)| (Box::new(stream) as BoxedStream, peer.to_string())))
    }
}

/// Everything a session needs, shared by both accept loops.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub programs: Arc<ProgramRegistry>,
    pub clients: Arc<ClientRegistry>,
    pub notifier: DisconnectNotifier,
    pub sessions: TaskTracker,
    pub max_record: usize,
}

/// Accept connections until `stop` fires or the listener closes.
pub(crate) async fn accept_loop<L: Listener>(
    mut listener: L,
    stop: CancellationToken,
    cx: SessionContext,
) {
    let transport = listener.transport();
    info!(%transport, address = %listener.local_addr(), "Started server");
    let throttle = LogThrottle::new(Duration::from_secs(1));

    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(Some((stream, peer))) => {
                let conn = Connection::new(transport, peer);
                spawn_session(stream, conn.clone(), stop.clone(), &cx);
                info!(
                    %transport,
                    peer = %conn.peer(),
                    clients_connected = cx.clients.connected(),
                    "Client connected"
                );
            }
            Ok(None) => {
                info!(%transport, "Listener closed");
                break;
            }
            Err(e) => {
                if throttle.should_log() {
                    warn!(%transport, error = %e, "Failed to accept connection");
                }
            }
        }
    }

    debug!(%transport, "Stopped accepting new connections");
}

/// Register the connection and serve it until the client leaves or the
/// server stops, whichever happens first.
fn spawn_session(stream: BoxedStream, conn: Conn, stop: CancellationToken, cx: &SessionContext) {
    cx.clients.add(&conn);

    let dispatcher = Dispatcher::bind(cx.programs.clone(), conn.clone());
    let codec = ServerCodec::new(stream, conn.clone(), cx.notifier.clone(), cx.max_record);
    let closer = codec.closer();

    cx.sessions.spawn(async move {
        tokio::select! {
            served = codec.serve(&dispatcher) => {
                if let Err(e) = served {
                    warn!(
                        transport = %conn.transport(),
                        peer = %conn.peer(),
                        error = %e,
                        "Session ended with error"
                    );
                }
            }
            _ = stop.cancelled() => {
                debug!(peer = %conn.peer(), "Closing session, server is stopping");
            }
        }
        closer.close();
    });
}
