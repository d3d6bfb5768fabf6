//! `{{path}}` placeholder rendering against a node's input snapshot.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::expr::lookup;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_$][A-Za-z0-9_.$-]*)\s*\}\}").unwrap_or_else(|_| unreachable!())
    })
}

/// Whether `template` contains at least one placeholder.
pub fn has_placeholders(template: &str) -> bool {
    placeholder().is_match(template)
}

/// Replace placeholders. Strings are inserted raw, other values as JSON,
/// missing values as the empty string.
pub fn render(template: &str, input: &HashMap<String, Value>) -> String {
    placeholder()
        .replace_all(template, |caps: &regex::Captures<'_>| match lookup(input, &caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        })
        .into_owned()
}

/// Render every string leaf of a JSON value.
///
/// A string that is exactly one placeholder is replaced by the referenced
/// value itself, so `"{{items}}"` keeps an array an array.
pub fn render_value(value: &Value, input: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(caps) = placeholder().captures(trimmed) {
                if caps.get(0).map(|m| m.as_str().len()) == Some(trimmed.len()) {
                    if let Some(v) = lookup(input, &caps[1]) {
                        return v.clone();
                    }
                }
            }
            Value::String(render(s, input))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, input)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, input)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Build an LLM prompt. A template without placeholders gets the declared
/// usage fields appended as a context block.
pub fn build_prompt(template: &str, usage_fields: &[String], input: &HashMap<String, Value>) -> String {
    if has_placeholders(template) || usage_fields.is_empty() {
        return render(template, input);
    }

    let mut prompt = String::from("## Context Data\n\n");
    for key in usage_fields {
        let rendered = match input.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()),
            None => "null".to_string(),
        };
        prompt.push_str(&format!("### {}\n{}\n\n", key, rendered));
    }
    prompt.push_str("## Task\n\n");
    prompt.push_str(template);
    prompt
}
