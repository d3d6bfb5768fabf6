//! Scripted capabilities and event helpers for flowrun tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use flowrun_core::config::ModelConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::event::ExecutionEvent;
use flowrun_core::traits::{CodeRunner, HttpClient, LlmClient, ToolDispatcher};
use flowrun_core::types::*;

/// LLM client that replays scripted replies.
///
/// Each call pops the next queued reply; once the queue is empty the default
/// reply is used. Chunks are streamed as `TextDelta`s.
pub struct ScriptedLlm {
    queue: Mutex<VecDeque<Vec<String>>>,
    default_reply: Vec<String>,
    chunk_delay: Duration,
    hang: bool,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    /// Reply to every call with these chunks.
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            default_reply: chunks.iter().map(|c| c.to_string()).collect(),
            chunk_delay: Duration::ZERO,
            hang: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A client whose stream never yields. Only cancellation ends it.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new(&[])
        }
    }

    /// Queue a reply for the next unanswered call.
    pub fn then(self, chunks: &[&str]) -> Self {
        self.queue
            .lock()
            .unwrap()
            .push_back(chunks.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Sleep before each chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Messages of every call so far.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl LlmClient for ScriptedLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.calls.lock().unwrap().push(messages);
        let reply = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone());
        let delay = self.chunk_delay;

        let deltas: BoxStream<'_, Result<StreamDelta>> = if self.hang {
            stream::pending().boxed()
        } else {
            stream::iter(reply)
                .then(move |chunk| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(StreamDelta::TextDelta(chunk))
                })
                .chain(stream::iter([Ok(StreamDelta::Stop(StopReason::EndTurn))]))
                .boxed()
        };
        Box::pin(async move { Ok(deltas) })
    }
}

/// How a scripted tool responds.
#[derive(Debug, Clone)]
pub enum ToolBehavior {
    Return(Value),
    Fail(String),
    /// Fail with a capability timeout of this many seconds.
    TimeOut(u64),
    /// Sleep, then return.
    Delay(Duration, Value),
    /// Wait for cancellation.
    Hang,
}

/// Tool dispatcher with per-name scripted behavior. Unknown names fail
/// with `ToolNotFound`.
#[derive(Default)]
pub struct ScriptedTools {
    behaviors: HashMap<String, ToolBehavior>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, behavior: ToolBehavior) -> Self {
        self.behaviors.insert(name.to_string(), behavior);
        self
    }

    /// `(tool name, input)` of every call so far.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn was_called(&self, name: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|(n, _)| n == name)
    }
}

impl ToolDispatcher for ScriptedTools {
    fn call(&self, name: &str, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        self.calls.lock().unwrap().push((name.to_string(), input));
        let behavior = self.behaviors.get(name).cloned();
        let name = name.to_string();

        Box::pin(async move {
            match behavior {
                None => Err(FlowError::ToolNotFound(name)),
                Some(ToolBehavior::Return(v)) => Ok(v),
                Some(ToolBehavior::Fail(message)) => Err(FlowError::ToolExecution { tool: name, message }),
                Some(ToolBehavior::TimeOut(secs)) => Err(FlowError::Timeout {
                    what: format!("tool {}", name),
                    timeout_secs: secs,
                }),
                Some(ToolBehavior::Delay(delay, v)) => {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => Err(FlowError::Cancelled),
                        _ = tokio::time::sleep(delay) => Ok(v),
                    }
                }
                Some(ToolBehavior::Hang) => {
                    ctx.cancel.cancelled().await;
                    Err(FlowError::Cancelled)
                }
            }
        })
    }
}

/// Code runner returning a fixed output and recording requests.
pub struct StubCodeRunner {
    output: CodeOutput,
    requests: Mutex<Vec<CodeRequest>>,
}

impl StubCodeRunner {
    pub fn new(output: CodeOutput) -> Self {
        Self {
            output,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Exit 0 with the given stdout.
    pub fn stdout(stdout: &str) -> Self {
        Self::new(CodeOutput {
            stdout: stdout.to_string(),
            ..Default::default()
        })
    }

    pub fn requests(&self) -> Vec<CodeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl CodeRunner for StubCodeRunner {
    fn run(&self, request: CodeRequest, _cancel: CancellationToken) -> BoxFuture<'_, Result<CodeOutput>> {
        self.requests.lock().unwrap().push(request);
        let output = self.output.clone();
        Box::pin(async move { Ok(output) })
    }
}

/// HTTP client returning a fixed response and recording requests.
pub struct StubHttp {
    status: u16,
    reason: String,
    body: String,
    requests: Mutex<Vec<HttpRequest>>,
}

impl StubHttp {
    pub fn new(status: u16, reason: &str, body: &str) -> Self {
        Self {
            status,
            reason: reason.to_string(),
            body: body.to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn ok_json(body: Value) -> Self {
        Self::new(200, "OK", &body.to_string())
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HttpClient for StubHttp {
    fn send(&self, request: HttpRequest, _cancel: CancellationToken) -> BoxFuture<'_, Result<HttpResponse>> {
        self.requests.lock().unwrap().push(request);
        let response = HttpResponse {
            status: self.status,
            reason: self.reason.clone(),
            headers: Default::default(),
            body: self.body.clone(),
        };
        Box::pin(async move { Ok(response) })
    }
}

/// Turn a JSON object into run input. Anything else yields an empty map.
pub fn input(value: Value) -> HashMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}

/// Drain an event channel until it closes, failing after 10 seconds.
pub async fn collect_events(mut rx: mpsc::UnboundedReceiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
    })
    .await;
    assert!(drained.is_ok(), "event stream did not close within 10s");
    events
}

/// Compact labels like `NODE_START(ask)` or `WORKFLOW_END(COMPLETED)`.
pub fn event_types(events: &[ExecutionEvent]) -> Vec<String> {
    use flowrun_core::event::EventKind;
    events
        .iter()
        .map(|e| match &e.kind {
            EventKind::WorkflowStart { .. } => "WORKFLOW_START".to_string(),
            EventKind::WorkflowEnd { status, .. } => format!("WORKFLOW_END({:?})", status).to_uppercase(),
            kind => format!("{}({})", kind.type_name(), kind.node_id().unwrap_or_default()),
        })
        .collect()
}

/// Ids of nodes that received `NODE_START`, in order.
pub fn started_nodes(events: &[ExecutionEvent]) -> Vec<String> {
    nodes_with(events, "NODE_START")
}

/// Ids of nodes that received an event of the given type, in order.
pub fn nodes_with(events: &[ExecutionEvent], type_name: &str) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.type_name() == type_name)
        .filter_map(|e| e.node_id().map(str::to_string))
        .collect()
}

/// Index of the first event with this type and node.
pub fn position(events: &[ExecutionEvent], type_name: &str, node_id: &str) -> Option<usize> {
    events
        .iter()
        .position(|e| e.type_name() == type_name && e.node_id() == Some(node_id))
}

/// Per-node ordering and single-`WORKFLOW_END` checks that hold for every run.
pub fn assert_well_formed(events: &[ExecutionEvent]) {
    let ends = events.iter().filter(|e| e.type_name() == "WORKFLOW_END").count();
    assert_eq!(ends, 1, "expected exactly one WORKFLOW_END");
    assert_eq!(events.last().map(|e| e.type_name()), Some("WORKFLOW_END"));

    for (i, e) in events.iter().enumerate() {
        assert_eq!(e.seq, i as u64, "sequence numbers must be dense");
    }

    for node in started_nodes(events) {
        let start = position(events, "NODE_START", &node).unwrap_or(usize::MAX);
        let terminal: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.node_id() == Some(node.as_str()) && matches!(e.type_name(), "NODE_END" | "NODE_ERROR")
            })
            .map(|(i, _)| i)
            .collect();
        assert_eq!(terminal.len(), 1, "node {} must end exactly once", node);
        for (i, e) in events.iter().enumerate() {
            if e.node_id() == Some(node.as_str()) && e.type_name() == "NODE_OUTPUT" {
                assert!(i > start && i < terminal[0], "NODE_OUTPUT of {} out of order", node);
            }
        }
    }
}
