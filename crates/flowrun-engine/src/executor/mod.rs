//! Node Executor Registry and the executors behind each node type.
//!
//! Executors receive a `NodeInvocation` and return a `NodeOutcome` (the patch
//! to merge into Run State plus a routing decision) or a `NodeError`.
//! Capabilities (LLM, tools, code, HTTP) are injected when the registry is
//! built.

mod binding;
mod builtin;
mod code;
mod http;
mod llm;
mod tool;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use flowrun_core::config::ModelConfig;
use flowrun_core::error::NodeError;
use flowrun_core::event::{EventBus, EventKind};
use flowrun_core::schema::{Node, NodeType};
use flowrun_core::traits::{CodeRunner, HttpClient, LlmClient, ToolDispatcher};

use crate::expr::Expr;
use crate::state::Patch;

pub use binding::{bind_output, patch_to_value};
pub use builtin::{ConditionExecutor, EndExecutor, InformationExecutor, StartExecutor};
pub use code::CodeExecutor;
pub use http::HttpExecutor;
pub use llm::LlmExecutor;
pub use tool::ToolExecutor;

/// Streams partial output of one node as `NODE_OUTPUT` events.
#[derive(Clone)]
pub struct OutputSink {
    bus: Arc<EventBus>,
    node_id: String,
}

impl OutputSink {
    pub fn new(bus: Arc<EventBus>, node_id: impl Into<String>) -> Self {
        Self {
            bus,
            node_id: node_id.into(),
        }
    }

    /// Publish a partial result. Dropped silently once the node has ended.
    pub fn emit(&self, data: Value) {
        self.bus.publish(EventKind::NodeOutput {
            node_id: self.node_id.clone(),
            data,
        });
    }
}

/// Everything an executor gets for one node execution.
pub struct NodeInvocation {
    pub node: Arc<Node>,
    /// Input snapshot: the node's usage fields, or the whole Run State when
    /// it declares none. For the start node this is the caller's input.
    pub input: HashMap<String, Value>,
    pub output: OutputSink,
    pub cancel: CancellationToken,
    /// Parsed predicate, set for condition nodes.
    pub condition: Option<Expr>,
}

impl NodeInvocation {
    pub fn node_id(&self) -> &str {
        &self.node.id
    }
}

/// Which outgoing edges a finished node activates.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Every outgoing edge.
    All,
    /// Only the edge labelled with this branch.
    Branch(bool),
    /// End the run with this output.
    Finish(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub patch: Patch,
    /// Payload of the node's `NODE_END` event.
    pub output: Value,
    pub route: Route,
}

impl NodeOutcome {
    /// Activate all successors; the event output mirrors the patch.
    pub fn patch(patch: Patch) -> Self {
        Self {
            output: patch_to_value(&patch),
            patch,
            route: Route::All,
        }
    }

    pub fn empty() -> Self {
        Self::patch(Patch::new())
    }
}

/// Executes one kind of node.
pub trait NodeExecutor: Send + Sync + 'static {
    fn execute(&self, invocation: NodeInvocation) -> BoxFuture<'_, Result<NodeOutcome, NodeError>>;
}

/// Maps node type to executor. Built explicitly per engine; entries can be
/// swapped with `register`.
#[derive(Clone)]
pub struct NodeExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl NodeExecutorRegistry {
    /// Registry with the capability-free executors: start, end, condition
    /// and information.
    pub fn new() -> Self {
        let mut registry = Self {
            executors: HashMap::new(),
        };
        registry.register(NodeType::Start, Arc::new(StartExecutor));
        registry.register(NodeType::End, Arc::new(EndExecutor));
        registry.register(NodeType::Condition, Arc::new(ConditionExecutor));
        registry.register(NodeType::Information, Arc::new(InformationExecutor));
        registry
    }

    pub fn with_llm(mut self, client: Arc<dyn LlmClient>, default_model: ModelConfig) -> Self {
        self.register(NodeType::Llm, Arc::new(LlmExecutor::new(client, default_model)));
        self
    }

    pub fn with_tools(mut self, dispatcher: Arc<dyn ToolDispatcher>) -> Self {
        self.register(NodeType::Tool, Arc::new(ToolExecutor::new(dispatcher)));
        self
    }

    pub fn with_code_runner(mut self, runner: Arc<dyn CodeRunner>) -> Self {
        self.register(NodeType::Code, Arc::new(CodeExecutor::new(runner)));
        self
    }

    pub fn with_http(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.register(NodeType::Http, Arc::new(HttpExecutor::new(client)));
        self
    }

    /// Install or replace the executor for a node type.
    pub fn register(&mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(node_type, executor);
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type).cloned()
    }

    pub fn contains(&self, node_type: NodeType) -> bool {
        self.executors.contains_key(&node_type)
    }
}

impl Default for NodeExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
