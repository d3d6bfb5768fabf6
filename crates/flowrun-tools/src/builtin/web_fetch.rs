use std::sync::OnceLock;
use std::time::Duration;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use flowrun_core::config::HttpClientConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::Tool;
use flowrun_core::types::{ToolContext, ToolResult};

/// GET a URL and return its text, with HTML reduced to plain text.
pub struct WebFetchTool {
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new(config: &HttpClientConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client for web_fetch");
                reqwest::Client::new()
            });
        Self { client }
    }
}

#[derive(Deserialize)]
struct WebFetchInput {
    url: String,
    #[serde(default)]
    max_length: Option<usize>,
}

fn fetch_error(message: String) -> FlowError {
    FlowError::ToolExecution {
        tool: "web_fetch".to_string(),
        message,
    }
}

impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn timeout_secs(&self) -> u64 {
        60
    }

    fn description(&self) -> &str {
        "Fetch content from a URL. Strips HTML tags and returns plain text, truncated to max_length."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "The URL to fetch content from" },
                "max_length": { "type": "integer", "description": "Maximum characters to return (default: 30000)" }
            },
            "required": ["url"]
        })
    }

    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: WebFetchInput =
                serde_json::from_value(input).map_err(|e| FlowError::ToolValidation(e.to_string()))?;
            let max_length = params.max_length.unwrap_or(30_000);
            debug!(url = %params.url, node_id = %ctx.node_id, "Fetching URL");

            let fetch = async {
                let resp = self
                    .client
                    .get(&params.url)
                    .send()
                    .await
                    .map_err(|e| fetch_error(format!("request failed: {}", e)))?;

                let status = resp.status();
                if !status.is_success() {
                    return Ok(ToolResult::error(format!(
                        "HTTP {} {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("Unknown")
                    )));
                }

                let is_html = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|ct| ct.contains("html"));
                let body = resp
                    .text()
                    .await
                    .map_err(|e| fetch_error(format!("failed to read response body: {}", e)))?;

                let text = if is_html { strip_html_tags(&body) } else { body };
                Ok::<_, FlowError>(ToolResult::success(truncate_chars(text, max_length)))
            };

            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(FlowError::Cancelled),
                result = fetch => result,
            }
        })
    }
}

fn truncate_chars(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}\n\n[truncated at {} chars]", &text[..cut], max_chars),
        None => text,
    }
}

struct HtmlPatterns {
    script: Regex,
    style: Regex,
    tags: Regex,
    blank_lines: Regex,
}

fn html_patterns() -> &'static HtmlPatterns {
    static PATTERNS: OnceLock<HtmlPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |p: &str| Regex::new(p).unwrap_or_else(|_| unreachable!());
        HtmlPatterns {
            script: compile(r"(?is)<script[^>]*>.*?</script>"),
            style: compile(r"(?is)<style[^>]*>.*?</style>"),
            tags: compile(r"<[^>]+>"),
            blank_lines: compile(r"\n{3,}"),
        }
    })
}

/// Basic HTML-to-text: drop scripts, styles and tags, decode common entities.
fn strip_html_tags(html: &str) -> String {
    let p = html_patterns();
    let cleaned = p.script.replace_all(html, "");
    let cleaned = p.style.replace_all(&cleaned, "");
    let text = p.tags.replace_all(&cleaned, "");

    let text = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&");

    p.blank_lines.replace_all(&text, "\n\n").trim().to_string()
}
