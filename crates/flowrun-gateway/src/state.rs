use tokio_util::sync::CancellationToken;

use flowrun_engine::WorkflowEngine;

/// Shared application state for axum handlers.
pub struct AppState {
    pub engine: WorkflowEngine,
    /// Parent of every run's cancellation token.
    pub shutdown: CancellationToken,
}
