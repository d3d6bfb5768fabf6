use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::Tool;
use flowrun_core::types::{ToolContext, ToolResult};

pub struct CurrentTimeTool;

#[derive(Deserialize, Default)]
struct CurrentTimeInput {
    /// strftime format for the `formatted` field.
    #[serde(default)]
    format: Option<String>,
}

impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Current UTC time as RFC 3339, Unix seconds and an optional custom format."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "format": { "type": "string", "description": "strftime format, e.g. '%Y-%m-%d'" }
            }
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }

    fn execute(&self, input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            // Tool nodes without arguments pass their whole input snapshot.
            let p: CurrentTimeInput = if input.get("format").is_some() {
                serde_json::from_value(input).map_err(|e| FlowError::ToolValidation(e.to_string()))?
            } else {
                CurrentTimeInput::default()
            };

            let now = chrono::Utc::now();
            let mut result = serde_json::json!({
                "iso": now.to_rfc3339(),
                "unix": now.timestamp(),
                "date": now.format("%Y-%m-%d").to_string(),
            });
            if let Some(format) = p.format {
                let items: Vec<_> = chrono::format::StrftimeItems::new(&format).collect();
                if items.iter().any(|i| matches!(i, chrono::format::Item::Error)) {
                    return Err(FlowError::ToolValidation(format!("invalid time format: {}", format)));
                }
                result["formatted"] = Value::String(now.format_with_items(items.into_iter()).to_string());
            }
            Ok(ToolResult::success(result))
        })
    }
}
