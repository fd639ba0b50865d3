//! Shared application state

use crate::gateway::StreamGateway;
use crate::service::LinkService;
use devlink_auth::LinkController;
use devlink_core::Config;
use std::sync::Arc;

/// State shared by every handler
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Session creation and provider supervision
    pub service: Arc<LinkService>,
}

impl AppState {
    /// Create a new application state
    pub fn new(config: Config, service: Arc<LinkService>) -> Self {
        Self { config, service }
    }

    pub fn controller(&self) -> &Arc<LinkController> {
        self.service.controller()
    }

    /// Gateway for a new stream subscription
    pub fn gateway(&self) -> StreamGateway {
        StreamGateway::new(self.service.clone(), &self.config)
    }
}
