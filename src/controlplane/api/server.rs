//! API Server
//!
//! Serves the REST API for the control plane until shutdown is signalled.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::rest::RestRouter;
use crate::controlplane::Orchestrator;
use crate::registry::MemoryOptions;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// REST API server with graceful shutdown
pub struct ApiServer {
    config: ApiServerConfig,
    orchestrator: Arc<Orchestrator>,
    options: Arc<MemoryOptions>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(
        config: ApiServerConfig,
        orchestrator: Arc<Orchestrator>,
        options: Arc<MemoryOptions>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            orchestrator,
            options,
            shutdown_tx,
        }
    }

    /// Run the API server until [`ApiServer::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.rest_addr;
        let app = RestRouter::new(self.orchestrator.clone(), self.options.clone()).build();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        info!("REST API listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
