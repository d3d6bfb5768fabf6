use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use flowrun_core::config::HttpClientConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::{Tool, ToolDispatcher};
use flowrun_core::types::{ToolContext, ToolDefinition, ToolResult};

/// Registry of available tools. Tool nodes dispatch through it by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Definitions of every registered tool, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name under its own timeout and the caller's
    /// cancellation token.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| FlowError::ToolNotFound(name.to_string()))?;

        let timeout_secs = tool.timeout_secs();
        let cancel = ctx.cancel.clone();
        debug!(tool = %name, node_id = %ctx.node_id, "Executing tool");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FlowError::Cancelled),
            result = tokio::time::timeout(Duration::from_secs(timeout_secs), tool.execute(input, ctx)) => {
                result.unwrap_or_else(|_| Err(FlowError::Timeout {
                    what: format!("tool {}", name),
                    timeout_secs,
                }))
            }
        }
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins(http: &HttpClientConfig) -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::data::JsonQueryTool);
        registry.register(crate::builtin::data::RegexReplaceTool);
        registry.register(crate::builtin::time::CurrentTimeTool);
        registry.register(crate::builtin::web_fetch::WebFetchTool::new(http));
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolDispatcher for ToolRegistry {
    fn call(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        let name = name.to_string();
        Box::pin(async move {
            let result = self.execute(&name, input, ctx).await?;
            if result.is_error {
                let message = match result.content {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                return Err(FlowError::ToolExecution { tool: name, message });
            }
            Ok(result.content)
        })
    }
}
