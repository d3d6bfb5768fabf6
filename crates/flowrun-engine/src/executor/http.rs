use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::info;

use flowrun_core::error::NodeError;
use flowrun_core::schema::NodeKind;
use flowrun_core::traits::HttpClient;
use flowrun_core::types::HttpRequest;

use super::{bind_output, NodeExecutor, NodeInvocation, NodeOutcome};
use crate::template;

/// Sends the node's request through the injected HTTP client.
pub struct HttpExecutor {
    client: Arc<dyn HttpClient>,
}

impl HttpExecutor {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }
}

impl NodeExecutor for HttpExecutor {
    fn execute(&self, inv: NodeInvocation) -> BoxFuture<'_, Result<NodeOutcome, NodeError>> {
        Box::pin(async move {
            let node = inv.node.clone();
            let NodeKind::Http(cfg) = &node.kind else {
                return Err(NodeError::failure(&node.id, "not an http node"));
            };

            let request = HttpRequest {
                method: cfg.method.to_uppercase(),
                url: template::render(&cfg.url, &inv.input),
                headers: cfg
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), template::render(v, &inv.input)))
                    .collect(),
                body: cfg.body.as_ref().map(|b| template::render(b, &inv.input)),
            };

            info!(node_id = %node.id, method = %request.method, url = %request.url, "HTTP request");
            let response = self
                .client
                .send(request, inv.cancel.clone())
                .await
                .map_err(|e| NodeError::from_flow(&node.id, e))?;

            if !response.is_success() {
                return Err(NodeError::failure(
                    &node.id,
                    format!("HTTP {} {}", response.status, response.reason),
                ));
            }

            let result = serde_json::from_str::<Value>(&response.body)
                .unwrap_or_else(|_| Value::String(response.body.clone()));
            Ok(NodeOutcome::patch(bind_output(&node, result)))
        })
    }
}
