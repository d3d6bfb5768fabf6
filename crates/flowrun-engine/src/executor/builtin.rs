//! Executors that need no injected capability.

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use flowrun_core::error::NodeError;
use flowrun_core::schema::NodeKind;

use super::{NodeExecutor, NodeInvocation, NodeOutcome, Route};
use crate::state::Patch;

/// Checks the caller's input and seeds the Run State with it.
pub struct StartExecutor;

impl NodeExecutor for StartExecutor {
    fn execute(&self, inv: NodeInvocation) -> BoxFuture<'_, Result<NodeOutcome, NodeError>> {
        Box::pin(async move {
            let node = &inv.node;
            let required: &[String] = match &node.kind {
                NodeKind::Start(cfg) => &cfg.required,
                _ => &[],
            };

            let missing: Vec<&str> = required
                .iter()
                .filter(|k| matches!(inv.input.get(*k), None | Some(Value::Null)))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(NodeError::validation(
                    &node.id,
                    format!("missing required input: {}", missing.join(", ")),
                ));
            }

            for (key, kind) in &node.generate_fields {
                if let Some(value) = inv.input.get(key) {
                    if !value.is_null() && !kind.accepts(value) {
                        return Err(NodeError::validation(
                            &node.id,
                            format!("input field {} is not a valid {:?}", key, kind),
                        ));
                    }
                }
            }

            let patch: Patch = if node.generate_fields.is_empty() {
                inv.input
            } else {
                inv.input
                    .into_iter()
                    .filter(|(k, _)| node.generate_fields.contains_key(k))
                    .collect()
            };
            debug!(node_id = %node.id, fields = patch.len(), "Start input accepted");
            Ok(NodeOutcome::patch(patch))
        })
    }
}

/// Assembles the workflow output and finishes the run.
pub struct EndExecutor;

impl NodeExecutor for EndExecutor {
    fn execute(&self, inv: NodeInvocation) -> BoxFuture<'_, Result<NodeOutcome, NodeError>> {
        Box::pin(async move {
            let output: Value = if inv.node.usage_fields.is_empty() {
                Value::Object(inv.input.into_iter().collect())
            } else {
                Value::Object(
                    inv.node
                        .usage_fields
                        .iter()
                        .map(|k| (k.clone(), inv.input.get(k).cloned().unwrap_or(Value::Null)))
                        .collect(),
                )
            };
            Ok(NodeOutcome {
                patch: Patch::new(),
                output: output.clone(),
                route: Route::Finish(output),
            })
        })
    }
}

/// Evaluates the node's predicate and picks a branch.
pub struct ConditionExecutor;

impl NodeExecutor for ConditionExecutor {
    fn execute(&self, inv: NodeInvocation) -> BoxFuture<'_, Result<NodeOutcome, NodeError>> {
        Box::pin(async move {
            let expr = match (&inv.condition, &inv.node.kind) {
                (Some(expr), _) => expr.clone(),
                (None, NodeKind::Condition(cfg)) => crate::expr::Expr::parse(&cfg.expression)
                    .map_err(|e| NodeError::validation(&inv.node.id, e.to_string()))?,
                (None, _) => {
                    return Err(NodeError::failure(&inv.node.id, "not a condition node"));
                }
            };
            let result = expr.evaluate(&inv.input);
            debug!(node_id = %inv.node.id, result, "Condition evaluated");
            Ok(NodeOutcome {
                patch: Patch::new(),
                output: json!({ "result": result }),
                route: Route::Branch(result),
            })
        })
    }
}

/// Documentation only.
pub struct InformationExecutor;

impl NodeExecutor for InformationExecutor {
    fn execute(&self, _inv: NodeInvocation) -> BoxFuture<'_, Result<NodeOutcome, NodeError>> {
        Box::pin(async { Ok(NodeOutcome::empty()) })
    }
}
