//! Application state shared across routes

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::relay::SessionRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let sessions = Arc::new(SessionRegistry::new(
            config.max_records,
            config.log_dir.clone(),
        ));

        Self {
            config: Arc::new(config),
            sessions,
        }
    }
}
