use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use flowrun_core::error::GraphError;
use flowrun_core::schema::Workflow;
use flowrun_engine::RunOptions;

use crate::state::AppState;

#[derive(Deserialize)]
pub struct ValidateBody {
    pub workflow: Workflow,
}

#[derive(Deserialize)]
pub struct RunBody {
    pub workflow: Workflow,
    #[serde(default)]
    pub input: HashMap<String, Value>,
}

fn graph_error(err: &GraphError) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({
            "valid": false,
            "error": { "code": err.code(), "message": err.to_string() },
        })),
    )
        .into_response()
}

// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// POST /api/workflows/validate
pub async fn validate(State(state): State<Arc<AppState>>, Json(body): Json<ValidateBody>) -> Response {
    match state.engine.compile(&body.workflow) {
        Ok(graph) => Json(json!({
            "valid": true,
            "workflowId": graph.workflow_id(),
            "nodes": graph.node_count(),
            "topoOrder": graph.topo_order(),
        }))
        .into_response(),
        Err(e) => {
            debug!(workflow_id = %body.workflow.id, error = %e, "Workflow rejected");
            graph_error(&e)
        }
    }
}

// POST /api/workflows/run: stream the run's events as SSE
pub async fn run(State(state): State<Arc<AppState>>, Json(body): Json<RunBody>) -> Response {
    let graph = match state.engine.compile(&body.workflow) {
        Ok(graph) => graph,
        Err(e) => return graph_error(&e),
    };

    let cancel = state.shutdown.child_token();
    let handle = state.engine.start_with(
        graph,
        body.input,
        RunOptions {
            run_id: None,
            cancel: Some(cancel.clone()),
        },
    );
    let run_id = handle.run_id().to_string();
    info!(run_id = %run_id, workflow_id = %body.workflow.id, "Run started over SSE");

    // Dropping the response stream (client gone) cancels the run.
    let guard = cancel.drop_guard();
    let events = UnboundedReceiverStream::new(handle.events()).map(move |event| {
        let _ = &guard;
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(Event::default().data(data))
    });

    let mut response = Sse::new(events).keep_alive(KeepAlive::default()).into_response();
    if let Ok(value) = run_id.parse() {
        response.headers_mut().insert("x-run-id", value);
    }
    response
}
