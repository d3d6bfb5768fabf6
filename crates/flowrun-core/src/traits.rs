//! Capabilities the engine's executors call out to. Implementations are
//! injected when the executor registry is built; nothing here is global.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// Streaming chat completion client.
///
/// Cancellation is by dropping the returned stream.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// A named operation a tool node can call.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (what a tool node refers to).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Resolves a tool by name and runs it.
pub trait ToolDispatcher: Send + Sync + 'static {
    fn call(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Sandboxed code runner.
pub trait CodeRunner: Send + Sync + 'static {
    fn run(
        &self,
        request: CodeRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<CodeOutput>>;
}

/// Outbound HTTP client.
pub trait HttpClient: Send + Sync + 'static {
    fn send(
        &self,
        request: HttpRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<HttpResponse>>;
}
