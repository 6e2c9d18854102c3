//! Application state

use dunning_billing::{DunningService, DunningStore};
use std::sync::Arc;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub dunning: DunningService,
}

impl AppState {
    pub fn new(config: Config, dunning: DunningService) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        tracing::info!(
            expiry_hours = config.jwt_expiry_hours,
            "JWT authentication configured"
        );

        Self {
            config,
            jwt_manager,
            dunning,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn DunningStore> {
        &self.dunning.store
    }
}
