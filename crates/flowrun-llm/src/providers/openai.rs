use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use flowrun_core::config::ModelConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::LlmClient;
use flowrun_core::types::*;

use super::default_endpoint;
use crate::streaming::{SseEvent, SseStream};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, Groq, OpenRouter
/// and anything else that serves `/v1/chat/completions`.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    pub fn with_http(http: Client) -> Self {
        Self { http }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize, Debug, PartialEq)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDeltaContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct StreamDeltaContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    messages
        .into_iter()
        .map(|m| OaiMessage {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: m.content,
        })
        .collect()
}

fn endpoint(config: &ModelConfig) -> &str {
    config
        .base_url
        .as_deref()
        .or_else(|| default_endpoint(&config.provider))
        .unwrap_or(OPENAI_API_URL)
}

fn build_request(config: &ModelConfig, messages: Vec<ChatMessage>) -> ChatRequest<'_> {
    // o-series reasoning models reject `temperature`.
    let is_o_series = ["o1", "o3", "o4"].iter().any(|p| config.model_id.starts_with(p));
    ChatRequest {
        model: &config.model_id,
        messages: convert_messages(messages),
        max_tokens: config.max_tokens,
        temperature: (!is_o_series).then_some(config.temperature),
        stream: true,
        stream_options: StreamOptions { include_usage: true },
    }
}

fn parse_chunk(event: SseEvent) -> Vec<Result<StreamDelta>> {
    if event.data.trim() == "[DONE]" {
        return vec![];
    }

    let chunk: StreamChunk = match serde_json::from_str(&event.data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse SSE chunk");
            return vec![];
        }
    };

    let mut deltas = Vec::new();
    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            deltas.push(Ok(StreamDelta::TextDelta(text)));
        }
        if let Some(reason) = choice.finish_reason {
            let stop = match reason.as_str() {
                "length" => StopReason::MaxTokens,
                "stop_sequence" => StopReason::StopSequence,
                _ => StopReason::EndTurn,
            };
            deltas.push(Ok(StreamDelta::Stop(stop)));
        }
    }
    if let Some(usage) = chunk.usage {
        deltas.push(Ok(StreamDelta::Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }));
    }
    deltas
}

impl LlmClient for OpenAiClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();

        Box::pin(async move {
            let url = endpoint(&config).to_string();
            let body = build_request(&config, messages);
            debug!(url = %url, model = %config.model_id, "Sending chat request");

            let mut req = self.http.post(&url).json(&body);
            if let Some(api_key) = &config.api_key {
                req = req.bearer_auth(api_key);
            }
            if config.provider == "openrouter" && !config.extra_headers.contains_key("X-Title") {
                req = req.header("X-Title", "flowrun");
            }
            for (k, v) in &config.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let response = req
                .send()
                .await
                .map_err(|e| FlowError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(FlowError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let delta_stream = SseStream::new(response.bytes_stream())
                .map(|event| match event {
                    Ok(event) => futures::stream::iter(parse_chunk(event)),
                    Err(e) => futures::stream::iter(vec![Err(e)]),
                })
                .flatten();

            Ok(delta_stream.boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(data: &str) -> SseEvent {
        SseEvent {
            event_type: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_parse_text_delta() {
        let deltas = parse_chunk(sse(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#));
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].as_ref().unwrap(), &StreamDelta::TextDelta("Hel".into()));
    }

    #[test]
    fn test_parse_finish_and_usage() {
        let deltas = parse_chunk(sse(r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#));
        assert_eq!(deltas[0].as_ref().unwrap(), &StreamDelta::Stop(StopReason::MaxTokens));

        let deltas = parse_chunk(sse(r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#));
        assert_eq!(
            deltas[0].as_ref().unwrap(),
            &StreamDelta::Usage {
                input_tokens: 12,
                output_tokens: 3
            }
        );
    }

    #[test]
    fn test_done_and_garbage_are_ignored() {
        assert!(parse_chunk(sse("[DONE]")).is_empty());
        assert!(parse_chunk(sse("not json")).is_empty());
    }

    #[test]
    fn test_request_shape() {
        let mut config = ModelConfig::new("gpt-4o-mini");
        config.temperature = 0.3;
        let body = build_request(
            &config,
            vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert!((json["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);

        let o_series = ModelConfig::new("o3-mini");
        let json = serde_json::to_value(build_request(&o_series, vec![])).unwrap();
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_endpoint_resolution() {
        let mut config = ModelConfig::new("llama3");
        assert_eq!(endpoint(&config), OPENAI_API_URL);
        config.provider = "ollama".into();
        assert!(endpoint(&config).contains("localhost:11434"));
        config.base_url = Some("http://gpu-box:8000/v1/chat/completions".into());
        assert_eq!(endpoint(&config), "http://gpu-box:8000/v1/chat/completions");
    }
}
