//! SunRPC server core.
//!
//! Listens on a local Unix socket and on connections the shared-port
//! multiplexer recognises as SunRPC, gives every connection its own session,
//! and keeps the connected-client registry current.
//!
//! ## Architecture
//!
//! - `lock`: single-instance `flock` on `<rundir>/<socket>.lock`
//! - `endpoint`: stale socket cleanup and the self-unlinking Unix listener
//! - `mux`: shared TCP port multiplexer
//! - `program`: program registration and per-connection dispatch
//! - `clients`: connection handles and the client registry
//! - `session`: accept loops and session lifecycle
//! - `pruner`: disconnect notifications and registry pruning

pub mod clients;
pub mod endpoint;
pub mod lock;
pub mod mux;
pub mod program;
pub mod pruner;
mod session;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::context::AppContext;
use crate::programs;
use clients::{ClientRegistry, Conn};
use endpoint::LocalListener;
use lock::LockGuard;
use mux::MuxListener;
use program::{Program, ProgramRegistry, RegistryError};
use pruner::{DisconnectHook, DisconnectNotifier};
use session::SessionContext;

pub use session::Listener;

/// Errors that prevent the server from starting or serving.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to create run directory {}", path.display())]
    RunDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open lock file {}", path.display())]
    LockOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to get lock on {}: is another instance running?", path.display())]
    LockHeld {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("failed to clean up socket file {}", path.display())]
    Reclaim {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to listen on {}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registration(#[from] RegistryError),

    #[error("server is already serving or has been served")]
    AlreadyServing,
}

/// Startup-to-serve handoff: consumed by the first `serve()`.
struct Pending {
    network: MuxListener,
    notify_tx: mpsc::Sender<Conn>,
    notify_rx: mpsc::Receiver<Conn>,
}

/// The SunRPC server.
pub struct SunRpc {
    local: Arc<LocalListener>,
    pending: Mutex<Option<Pending>>,
    lock: Mutex<Option<LockGuard>>,
    programs: Arc<ProgramRegistry>,
    clients: Arc<ClientRegistry>,
    hooks: Vec<Arc<dyn DisconnectHook>>,
    tcp_stop: CancellationToken,
    unix_stop: CancellationToken,
    sessions: TaskTracker,
    max_record: usize,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SunRpc {
    /// Build the server with the default programs.
    pub fn new(ctx: &AppContext, network: MuxListener) -> Result<Self, ServerError> {
        let hooks = vec![ctx.portmap.clone() as Arc<dyn DisconnectHook>];
        Self::with_programs(
            &ctx.config,
            ctx.clients.clone(),
            network,
            programs::default_programs(ctx),
            hooks,
        )
    }

    /// Build the server with an explicit program list.
    ///
    /// Registers the programs, takes the instance lock, removes a stale
    /// socket file and binds the local listener, in that order. Any failure
    /// is fatal; nothing is retried. Must be called inside a Tokio runtime.
    pub fn with_programs(
        config: &AppConfig,
        clients: Arc<ClientRegistry>,
        network: MuxListener,
        programs: Vec<Arc<dyn Program>>,
        hooks: Vec<Arc<dyn DisconnectHook>>,
    ) -> Result<Self, ServerError> {
        let programs = ProgramRegistry::new(programs).inspect_err(|e| {
            error!(error = %e, "Could not register SunRPC program");
        })?;

        std::fs::create_dir_all(&config.rundir).map_err(|source| ServerError::RunDir {
            path: config.rundir.clone(),
            source,
        })?;

        let socket_path = config.socket_path();
        let lock = LockGuard::acquire(&config.lock_path()).inspect_err(|e| {
            error!(error = %e, "Failed to get instance lock");
        })?;

        endpoint::reclaim_stale(&socket_path).inspect_err(|e| {
            error!(error = %e, "Failed to clean up socket file");
        })?;

        let local = LocalListener::bind(&socket_path).inspect_err(|e| {
            error!(error = %e, "Failed to listen");
        })?;

        let (notify_tx, notify_rx) = mpsc::channel(config.notify_buffer.max(1));

        Ok(Self {
            local: Arc::new(local),
            pending: Mutex::new(Some(Pending {
                network,
                notify_tx,
                notify_rx,
            })),
            lock: Mutex::new(Some(lock)),
            programs: Arc::new(programs),
            clients,
            hooks,
            tcp_stop: CancellationToken::new(),
            unix_stop: CancellationToken::new(),
            sessions: TaskTracker::new(),
            max_record: config.max_record_size,
        })
    }

    /// Start the pruner and both accept loops; return once both loops have
    /// stopped.
    ///
    /// The pruner outlives this call until the last session has published
    /// its disconnect, then exits on its own.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let Pending {
            network,
            notify_tx,
            notify_rx,
        } = locked(&self.pending)
            .take()
            .ok_or(ServerError::AlreadyServing)?;

        tokio::spawn(pruner::run(
            notify_rx,
            self.clients.clone(),
            self.hooks.clone(),
        ));

        let notifier = DisconnectNotifier::new(notify_tx);
        let cx = SessionContext {
            programs: self.programs.clone(),
            clients: self.clients.clone(),
            notifier: notifier.clone(),
            sessions: self.sessions.clone(),
            max_record: self.max_record,
        };

        tokio::join!(
            session::accept_loop(network, self.tcp_stop.clone(), cx.clone()),
            session::accept_loop(self.local.clone(), self.unix_stop.clone(), cx),
        );

        let lost = notifier.dropped();
        if lost > 0 {
            warn!(
                lost,
                clients_connected = self.clients.connected(),
                "Disconnect notifications were lost, those clients are still counted"
            );
        }
        Ok(())
    }

    /// Stop both accept loops, close the local listener and release the
    /// instance lock.
    ///
    /// Returns immediately. Live sessions see the stop signal and close on
    /// their own; the multiplexer's port is left to the multiplexer.
    pub fn stop(&self) {
        self.tcp_stop.cancel();
        self.unix_stop.cancel();
        self.local.close();

        if let Some(lock) = locked(&self.lock).take() {
            lock.release();
        }
        info!("SunRPC server stopped");
    }

    /// Wait for every session to finish. Only meaningful after `stop()`.
    pub async fn drain(&self) {
        self.sessions.close();
        self.sessions.wait().await;
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn programs(&self) -> &ProgramRegistry {
        &self.programs
    }

    pub fn socket_path(&self) -> &Path {
        self.local.path()
    }
}
