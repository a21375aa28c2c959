pub(crate) mod auth;
mod handlers;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use crate::core::background::TaskPool;
use crate::core::config::FleetConfig;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::scheduler::JobSweeper;
use crate::core::store::FleetStore;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Arc<FleetStore>,
    pub(crate) sweeper: Arc<JobSweeper>,
    pub(crate) pool: TaskPool,
    pub(crate) config: Arc<FleetConfig>,
}

/// Operator-facing API server for the main process.
pub struct ApiServer {
    store: Arc<FleetStore>,
    sweeper: Arc<JobSweeper>,
    pool: TaskPool,
    config: Arc<FleetConfig>,
}

impl ApiServer {
    pub fn new(
        store: Arc<FleetStore>,
        sweeper: Arc<JobSweeper>,
        pool: TaskPool,
        config: Arc<FleetConfig>,
    ) -> Self {
        Self {
            store,
            sweeper,
            pool,
            config,
        }
    }
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("Admin API initializing");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let state = AppState {
            store: self.store.clone(),
            sweeper: self.sweeper.clone(),
            pool: self.pool.clone(),
            config: self.config.clone(),
        };
        let addr = format!("{}:{}", self.config.api_host, self.config.api_port);

        tokio::spawn(async move {
            let app = router::build_api_router(state);
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!("Admin API running at http://{addr}");
                    if let Err(e) = axum::serve(listener, app).await {
                        error!("Admin API crashed: {}", e);
                    }
                }
                Err(e) => error!("Admin API failed to bind {addr}: {}", e),
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("Admin API shutting down");
        Ok(())
    }
}
