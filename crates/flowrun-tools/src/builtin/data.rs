use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::Tool;
use flowrun_core::types::{ToolContext, ToolResult};

// ── JsonQueryTool ───────────────────────────────────────────────

pub struct JsonQueryTool;

#[derive(Deserialize)]
struct JsonQueryInput {
    /// A JSON value, or a string containing JSON.
    json: Value,
    path: String,
}

impl Tool for JsonQueryTool {
    fn name(&self) -> &str {
        "json_query"
    }

    fn description(&self) -> &str {
        "Select part of a JSON value by path (e.g. 'items[0].name')."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "json": { "description": "JSON value, or a string containing JSON" },
                "path": { "type": "string", "description": "Dot-notation path (e.g. 'items[0].name')" }
            },
            "required": ["json", "path"]
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }

    fn execute(&self, input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: JsonQueryInput =
                serde_json::from_value(input).map_err(|e| FlowError::ToolValidation(e.to_string()))?;
            let value = match p.json {
                Value::String(s) => serde_json::from_str(&s)
                    .map_err(|e| FlowError::ToolValidation(format!("invalid JSON: {}", e)))?,
                other => other,
            };
            Ok(ToolResult::success(json_path_query(&value, &p.path)))
        })
    }
}

/// Walk `a.b[0].c`. Anything missing yields `null`.
fn json_path_query(value: &Value, path: &str) -> Value {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, indexes) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            match current.get(key) {
                Some(v) => current = v,
                None => return Value::Null,
            }
        }
        for idx in indexes.split('[').filter_map(|s| s.strip_suffix(']')) {
            match idx.parse::<usize>().ok().and_then(|i| current.get(i)) {
                Some(v) => current = v,
                None => return Value::Null,
            }
        }
    }
    current.clone()
}

// ── RegexReplaceTool ────────────────────────────────────────────

pub struct RegexReplaceTool;

#[derive(Deserialize)]
struct RegexInput {
    text: String,
    pattern: String,
    replacement: String,
}

impl Tool for RegexReplaceTool {
    fn name(&self) -> &str {
        "regex_replace"
    }

    fn description(&self) -> &str {
        "Find and replace using a regex. `$1`-style groups are expanded."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "pattern": { "type": "string", "description": "Regex pattern" },
                "replacement": { "type": "string", "description": "Replacement string" }
            },
            "required": ["text", "pattern", "replacement"]
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }

    fn execute(&self, input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: RegexInput =
                serde_json::from_value(input).map_err(|e| FlowError::ToolValidation(e.to_string()))?;
            let re = regex::Regex::new(&p.pattern)
                .map_err(|e| FlowError::ToolValidation(format!("invalid regex: {}", e)))?;
            let result = re.replace_all(&p.text, p.replacement.as_str()).to_string();
            Ok(ToolResult::success(result))
        })
    }
}
