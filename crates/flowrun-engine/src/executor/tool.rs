use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::info;

use flowrun_core::error::NodeError;
use flowrun_core::schema::NodeKind;
use flowrun_core::traits::ToolDispatcher;
use flowrun_core::types::ToolContext;

use super::{bind_output, NodeExecutor, NodeInvocation, NodeOutcome};
use crate::template;

/// Resolves the node's tool through the injected dispatcher.
pub struct ToolExecutor {
    dispatcher: Arc<dyn ToolDispatcher>,
}

impl ToolExecutor {
    pub fn new(dispatcher: Arc<dyn ToolDispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl NodeExecutor for ToolExecutor {
    fn execute(&self, inv: NodeInvocation) -> BoxFuture<'_, Result<NodeOutcome, NodeError>> {
        Box::pin(async move {
            let node = inv.node.clone();
            let NodeKind::Tool(cfg) = &node.kind else {
                return Err(NodeError::failure(&node.id, "not a tool node"));
            };

            // Without explicit arguments the tool gets the input snapshot.
            let arguments = if cfg.arguments.is_null() {
                Value::Object(inv.input.clone().into_iter().collect())
            } else {
                template::render_value(&cfg.arguments, &inv.input)
            };

            info!(node_id = %node.id, tool = %cfg.tool, "Calling tool");
            let ctx = ToolContext {
                node_id: node.id.clone(),
                cancel: inv.cancel.clone(),
            };
            let result = self
                .dispatcher
                .call(&cfg.tool, arguments, ctx)
                .await
                .map_err(|e| NodeError::from_flow(&node.id, e))?;

            Ok(NodeOutcome::patch(bind_output(&node, result)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{input, invocation};
    use super::*;
    use flowrun_core::error::{FlowError, NodeErrorKind, Result as FlowResult};
    use flowrun_core::schema::{FieldKind, Node};
    use serde_json::json;

    /// Echoes its input back, or fails for the tool named `broken`.
    struct Echo;

    impl ToolDispatcher for Echo {
        fn call(&self, name: &str, input: Value, _ctx: ToolContext) -> BoxFuture<'_, FlowResult<Value>> {
            let name = name.to_string();
            Box::pin(async move {
                match name.as_str() {
                    "broken" => Err(FlowError::Timeout {
                        what: "tool broken".into(),
                        timeout_secs: 1,
                    }),
                    _ => Ok(json!({ "echo": input })),
                }
            })
        }
    }

    #[tokio::test]
    async fn renders_arguments_and_binds_result() {
        let exec = ToolExecutor::new(Arc::new(Echo));
        let node = Node::tool("t", "echo", json!({"q": "find {{topic}}", "ids": "{{ids}}"}))
            .with_output("echo", FieldKind::Object);
        let (inv, _) = invocation(node, input(&[("topic", json!("rust")), ("ids", json!([1, 2]))]));
        let out = exec.execute(inv).await.unwrap();
        assert_eq!(out.patch["echo"], json!({"q": "find rust", "ids": [1, 2]}));
    }

    #[tokio::test]
    async fn null_arguments_pass_the_snapshot() {
        let exec = ToolExecutor::new(Arc::new(Echo));
        let node = Node::tool("t", "echo", Value::Null);
        let (inv, _) = invocation(node, input(&[("a", json!(1))]));
        let out = exec.execute(inv).await.unwrap();
        assert_eq!(out.patch["t"], json!({"echo": {"a": 1}}));
    }

    #[tokio::test]
    async fn dispatcher_timeout_maps_to_node_timeout() {
        let exec = ToolExecutor::new(Arc::new(Echo));
        let (inv, _) = invocation(Node::tool("t", "broken", json!({})), input(&[]));
        let err = exec.execute(inv).await.unwrap_err();
        assert_eq!(err.kind(), NodeErrorKind::Timeout);
        assert_eq!(err.node_id(), "t");
    }
}
