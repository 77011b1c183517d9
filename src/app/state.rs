use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

use crate::app::config::AppConfig;
use crate::error::Result;
use crate::models::Gateway;
use crate::platform::AppPaths;

/// Process-wide service object. Built once at startup and handed to callers
/// by reference; `shutdown` releases everything the gateway holds.
pub struct AppState {
    config: Arc<RwLock<AppConfig>>,
    gateway: Arc<Gateway>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("Initializing application state");

        config.validate()?;
        let gateway = Arc::new(Gateway::from_config(&config)?);
        gateway.start_health_monitoring();

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            gateway,
        })
    }

    /// Load configuration from the platform paths and build the state.
    pub async fn from_paths(paths: AppPaths) -> Result<Self> {
        paths.ensure_dirs_exist()?;
        let config = AppConfig::load(&paths).await?;
        Self::new(config).await
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub async fn shutdown(&self) {
        info!("Shutting down application state");
        self.gateway.cleanup();
    }
}
