use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, info};

use flowrun_core::config::ModelConfig;
use flowrun_core::error::NodeError;
use flowrun_core::schema::{LlmConfig, NodeKind, OutputFormat};
use flowrun_core::traits::LlmClient;
use flowrun_core::types::{ChatMessage, StreamDelta};

use super::{bind_output, NodeExecutor, NodeInvocation, NodeOutcome};
use crate::template;

const JSON_INSTRUCTION: &str =
    "Respond with a single valid JSON value and nothing else. Do not wrap it in prose.";

/// Calls the injected language model and streams its text as `NODE_OUTPUT`.
pub struct LlmExecutor {
    client: Arc<dyn LlmClient>,
    default_model: ModelConfig,
}

impl LlmExecutor {
    pub fn new(client: Arc<dyn LlmClient>, default_model: ModelConfig) -> Self {
        Self {
            client,
            default_model,
        }
    }

    fn model_for(&self, cfg: &LlmConfig) -> ModelConfig {
        let mut model = self.default_model.clone();
        if let Some(ref id) = cfg.model {
            model.model_id = id.clone();
        }
        if let Some(t) = cfg.temperature {
            model.temperature = t;
        }
        if let Some(m) = cfg.max_tokens {
            model.max_tokens = m;
        }
        model
    }
}

impl NodeExecutor for LlmExecutor {
    fn execute(&self, inv: NodeInvocation) -> BoxFuture<'_, Result<NodeOutcome, NodeError>> {
        Box::pin(async move {
            let node = inv.node.clone();
            let NodeKind::Llm(cfg) = &node.kind else {
                return Err(NodeError::failure(&node.id, "not an llm node"));
            };

            let model = self.model_for(cfg);
            let mut messages = Vec::with_capacity(2);
            let system = match (cfg.system_prompt.as_deref(), cfg.output_schema) {
                (Some(s), OutputFormat::Json) => {
                    Some(format!("{}\n\n{}", template::render(s, &inv.input), JSON_INSTRUCTION))
                }
                (Some(s), OutputFormat::Text) => Some(template::render(s, &inv.input)),
                (None, OutputFormat::Json) => Some(JSON_INSTRUCTION.to_string()),
                (None, OutputFormat::Text) => None,
            };
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(template::build_prompt(
                &cfg.prompt,
                &node.usage_fields,
                &inv.input,
            )));

            info!(node_id = %node.id, model = %model.model_id, "Calling LLM");

            let mut stream = self
                .client
                .chat_stream(&model, messages)
                .await
                .map_err(|e| NodeError::from_flow(&node.id, e))?;

            let mut text = String::new();
            while let Some(delta) = stream.next().await {
                match delta.map_err(|e| NodeError::from_flow(&node.id, e))? {
                    StreamDelta::TextDelta(chunk) => {
                        text.push_str(&chunk);
                        inv.output.emit(json!({ "delta": chunk }));
                    }
                    StreamDelta::Usage {
                        input_tokens,
                        output_tokens,
                    } => {
                        debug!(node_id = %node.id, input_tokens, output_tokens, "LLM usage");
                    }
                    StreamDelta::Stop(reason) => {
                        debug!(node_id = %node.id, ?reason, "LLM stream stopped");
                    }
                }
            }

            let result = match cfg.output_schema {
                OutputFormat::Text => Value::String(text),
                OutputFormat::Json => parse_json_output(&text).ok_or_else(|| {
                    NodeError::failure(&node.id, format!("model did not return valid JSON: {}", preview(&text)))
                })?,
            };

            Ok(NodeOutcome::patch(bind_output(&node, result)))
        })
    }
}

/// Parse model output as JSON, tolerating a fenced code block around it.
fn parse_json_output(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))?
        .trim_start();
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    serde_json::from_str(inner.trim()).ok()
}

fn preview(text: &str) -> String {
    let mut s: String = text.chars().take(120).collect();
    if s.len() < text.len() {
        s.push_str("...");
    }
    s
}
