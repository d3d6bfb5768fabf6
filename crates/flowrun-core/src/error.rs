use serde::Serialize;
use thiserror::Error;

/// Failures raised by injected capabilities (LLM, tools, code, HTTP) and
/// by the supporting infrastructure around the engine.
#[derive(Debug, Error)]
pub enum FlowError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Capability errors
    #[error("{what} timed out after {timeout_secs}s")]
    Timeout { what: String, timeout_secs: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Code execution failed: {0}")]
    CodeExecution(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// Structural problems found while compiling a workflow. Always fatal and
/// reported before any run exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("edge {edge_id} references unknown node {node_id}")]
    DanglingEdge { edge_id: String, node_id: String },

    #[error("workflow must contain exactly one start node, found {found}")]
    MissingOrMultipleStart { found: usize },

    #[error("node {0} is not reachable from the start node")]
    OrphanNode(String),

    #[error("cycle detected through node {0}")]
    CycleDetected(String),

    #[error("condition node {node_id}: {reason}")]
    InvalidConditionBranching { node_id: String, reason: String },

    #[error("condition node {node_id} has an invalid expression: {message}")]
    InvalidExpression { node_id: String, message: String },
}

impl GraphError {
    /// Stable machine-readable code, used by the HTTP surface.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateNodeId(_) => "duplicate_node_id",
            Self::DanglingEdge { .. } => "dangling_edge",
            Self::MissingOrMultipleStart { .. } => "missing_or_multiple_start",
            Self::OrphanNode(_) => "orphan_node",
            Self::CycleDetected(_) => "cycle_detected",
            Self::InvalidConditionBranching { .. } => "invalid_condition_branching",
            Self::InvalidExpression { .. } => "invalid_expression",
        }
    }
}

/// A failure scoped to a single node execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("node {node_id}: validation failed: {message}")]
    Validation { node_id: String, message: String },

    #[error("node {node_id}: {message}")]
    ExecutorFailure { node_id: String, message: String },

    #[error("node {node_id}: timed out after {timeout_secs}s")]
    Timeout { node_id: String, timeout_secs: u64 },

    #[error("node {node_id}: cancelled")]
    Cancelled { node_id: String },
}

impl NodeError {
    pub fn validation(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    pub fn failure(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExecutorFailure {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    pub fn cancelled(node_id: impl Into<String>) -> Self {
        Self::Cancelled {
            node_id: node_id.into(),
        }
    }

    /// Map a capability failure onto the node-level taxonomy.
    pub fn from_flow(node_id: &str, err: FlowError) -> Self {
        match err {
            FlowError::Timeout { timeout_secs, .. } => Self::Timeout {
                node_id: node_id.to_string(),
                timeout_secs,
            },
            FlowError::Cancelled => Self::cancelled(node_id),
            FlowError::ToolValidation(msg) => Self::validation(node_id, msg),
            other => Self::failure(node_id, other.to_string()),
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            Self::Validation { node_id, .. }
            | Self::ExecutorFailure { node_id, .. }
            | Self::Timeout { node_id, .. }
            | Self::Cancelled { node_id } => node_id,
        }
    }

    pub fn kind(&self) -> NodeErrorKind {
        match self {
            Self::Validation { .. } => NodeErrorKind::Validation,
            Self::ExecutorFailure { .. } => NodeErrorKind::ExecutorFailure,
            Self::Timeout { .. } => NodeErrorKind::Timeout,
            Self::Cancelled { .. } => NodeErrorKind::Cancelled,
        }
    }

    /// Message without the node prefix, for event payloads.
    pub fn message(&self) -> String {
        match self {
            Self::Validation { message, .. } | Self::ExecutorFailure { message, .. } => {
                message.clone()
            }
            Self::Timeout { timeout_secs, .. } => format!("timed out after {}s", timeout_secs),
            Self::Cancelled { .. } => "cancelled".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorKind {
    Validation,
    ExecutorFailure,
    Timeout,
    Cancelled,
}

/// Why a run did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("run failed: {0}")]
    NodeFailed(NodeError),

    #[error("run cancelled")]
    Cancelled,

    #[error("run interrupted: {0}")]
    Interrupted(String),
}
