use std::sync::Arc;

use crate::config::AppConfig;
use crate::programs::portmap::Portmap;
use crate::server::clients::ClientRegistry;

/// Process-wide state, built once in `main` and handed to the server.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub clients: Arc<ClientRegistry>,
    pub portmap: Arc<Portmap>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            clients: Arc::new(ClientRegistry::new()),
            portmap: Arc::new(Portmap::new()),
        }
    }
}
