use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use flowrun_core::config::GatewayConfig;
use flowrun_engine::WorkflowEngine;

use crate::routes;
use crate::state::AppState;

/// HTTP gateway: validates workflows and streams runs as server-sent events.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: WorkflowEngine,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, engine: WorkflowEngine) -> Self {
        Self { config, engine }
    }

    /// Routes with their state. Runs started through the router are
    /// cancelled when `shutdown` fires.
    pub fn router(&self, shutdown: CancellationToken) -> Router {
        let state = Arc::new(AppState {
            engine: self.engine.clone(),
            shutdown,
        });

        Router::new()
            .route("/api/health", get(routes::health))
            .route("/api/workflows/validate", post(routes::validate))
            .route("/api/workflows/run", post(routes::run))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Serve until the cancellation token is triggered. Runs still streaming
    /// at shutdown are cancelled so their connections can drain.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router(shutdown.clone());

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
