use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{info, warn};

use flowrun_core::error::NodeError;
use flowrun_core::schema::NodeKind;
use flowrun_core::traits::CodeRunner;
use flowrun_core::types::{CodeOutput, CodeRequest};

use super::{bind_output, NodeExecutor, NodeInvocation, NodeOutcome};

/// Hands the node's snippet to the injected code runner.
pub struct CodeExecutor {
    runner: Arc<dyn CodeRunner>,
}

impl CodeExecutor {
    pub fn new(runner: Arc<dyn CodeRunner>) -> Self {
        Self { runner }
    }
}

impl NodeExecutor for CodeExecutor {
    fn execute(&self, inv: NodeInvocation) -> BoxFuture<'_, Result<NodeOutcome, NodeError>> {
        Box::pin(async move {
            let node = inv.node.clone();
            let NodeKind::Code(cfg) = &node.kind else {
                return Err(NodeError::failure(&node.id, "not a code node"));
            };

            // Source runs as written; Run State reaches it only as data.
            let request = CodeRequest {
                language: cfg.language.clone(),
                code: cfg.code.clone(),
                input: Value::Object(inv.input.into_iter().collect()),
            };

            info!(node_id = %node.id, language = %cfg.language, "Running code");
            let output = self
                .runner
                .run(request, inv.cancel.clone())
                .await
                .map_err(|e| NodeError::from_flow(&node.id, e))?;

            if output.exit_code != 0 {
                warn!(node_id = %node.id, exit_code = output.exit_code, "Code exited with error");
                let stderr = output.stderr.trim();
                let detail = if stderr.is_empty() { output.stdout.trim() } else { stderr };
                return Err(NodeError::failure(
                    &node.id,
                    format!("exit code {}: {}", output.exit_code, detail),
                ));
            }

            Ok(NodeOutcome::patch(bind_output(&node, code_result(&output))))
        })
    }
}

/// The last non-empty stdout line when it is JSON, otherwise all of stdout.
fn code_result(output: &CodeOutput) -> Value {
    let stdout = output.stdout.trim();
    if let Some(last) = stdout.lines().rev().find(|l| !l.trim().is_empty()) {
        if let Ok(v) = serde_json::from_str::<Value>(last.trim()) {
            return v;
        }
    }
    Value::String(stdout.to_string())
}
