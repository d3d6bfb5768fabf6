//! Workflow schema: nodes, edges, and the workflow that owns them.
//!
//! These are plain value types. A node's type and its payload form a closed
//! tagged union (`NodeKind`) flattened into the node object, so executor
//! dispatch is an exhaustive match rather than a lookup on free-form data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier within the workflow.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Free-form editor data (positions and the like). Opaque to the engine.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    /// Run State keys this node reads, in order.
    #[serde(default)]
    pub usage_fields: Vec<String>,
    /// Output fields this node produces and their kinds.
    #[serde(default)]
    pub generate_fields: BTreeMap<String, FieldKind>,
    /// What a failure of this node does to the rest of the run.
    #[serde(default)]
    pub on_error: ErrorPolicy,
    /// Optional explicit deadline for this node's executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Type discriminant plus type-specific payload.
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Type-specific node payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    Start(StartConfig),
    End(EndConfig),
    Condition(ConditionConfig),
    Llm(LlmConfig),
    Tool(ToolConfig),
    Code(CodeConfig),
    Http(HttpConfig),
    Information(InformationConfig),
}

/// Bare discriminant of `NodeKind`, used as the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Start,
    End,
    Condition,
    Llm,
    Tool,
    Code,
    Http,
    Information,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Condition => "condition",
            Self::Llm => "llm",
            Self::Tool => "tool",
            Self::Code => "code",
            Self::Http => "http",
            Self::Information => "information",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Start(_) => NodeType::Start,
            Self::End(_) => NodeType::End,
            Self::Condition(_) => NodeType::Condition,
            Self::Llm(_) => NodeType::Llm,
            Self::Tool(_) => NodeType::Tool,
            Self::Code(_) => NodeType::Code,
            Self::Http(_) => NodeType::Http,
            Self::Information(_) => NodeType::Information,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartConfig {
    /// Input fields the caller must supply.
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndConfig {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    /// Boolean predicate over the Run State, e.g. `score >= 0.5 && lang == "en"`.
    pub expression: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    /// Model id override; the configured default model is used when absent.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Message template, `{{field}}` placeholders are filled from Run State.
    pub prompt: String,
    #[serde(default)]
    pub output_schema: OutputFormat,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Registered tool name.
    pub tool: String,
    /// Tool arguments; string leaves are rendered as templates.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeConfig {
    /// `python`, `javascript` or `bash`.
    pub language: String,
    /// Source, run verbatim. `{{...}}` is not rendered here; the script reads
    /// its input as JSON from `FLOWRUN_INPUT` or stdin.
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InformationConfig {
    #[serde(default)]
    pub content: Option<String>,
}

/// Primitive kind of a generated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Number,
    Boolean,
    Date,
    Object,
    Array,
}

impl FieldKind {
    /// Whether `value` is an acceptable instance of this kind.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match (self, value) {
            (Self::Text, Value::String(_)) => true,
            (Self::Number, Value::Number(_)) => true,
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Date, Value::String(s)) => {
                chrono::DateTime::parse_from_rfc3339(s).is_ok()
                    || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
            }
            (Self::Object, Value::Object(_)) => true,
            (Self::Array, Value::Array(_)) => true,
            _ => false,
        }
    }
}

/// Failure policy for a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorPolicy {
    /// A failure ends the run with status FAILED.
    #[default]
    AbortWorkflow,
    /// A failure prunes the node's outgoing edges and the run carries on.
    ContinueOnError,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    /// Branch label on condition nodes (`true` / `false`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            target,
            source_handle: None,
            target_handle: None,
        }
    }

    /// Edge leaving a condition node on the given branch.
    pub fn branch(source: impl Into<String>, target: impl Into<String>, when: bool) -> Self {
        let mut edge = Self::new(source, target);
        edge.id = format!("{}:{}", edge.id, when);
        edge.source_handle = Some(when.to_string());
        edge
    }
}

/// A workflow as handed over by whatever persists it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self {
            id: id.into(),
            name: None,
            nodes,
            edges,
        }
    }

    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Node {
    /// Create a node with the given payload and no fields.
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            metadata: serde_json::Value::Null,
            usage_fields: vec![],
            generate_fields: BTreeMap::new(),
            on_error: ErrorPolicy::default(),
            timeout_secs: None,
            kind,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Start(StartConfig::default()))
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::End(EndConfig::default()))
    }

    pub fn condition(id: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Condition(ConditionConfig {
                expression: expression.into(),
            }),
        )
    }

    pub fn llm(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Llm(LlmConfig {
                prompt: prompt.into(),
                ..Default::default()
            }),
        )
    }

    pub fn tool(id: impl Into<String>, tool: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self::new(
            id,
            NodeKind::Tool(ToolConfig {
                tool: tool.into(),
                arguments,
            }),
        )
    }

    pub fn code(id: impl Into<String>, language: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Code(CodeConfig {
                language: language.into(),
                code: code.into(),
            }),
        )
    }

    pub fn http(id: impl Into<String>, method: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Http(HttpConfig {
                method: method.into(),
                url: url.into(),
                headers: BTreeMap::new(),
                body: None,
            }),
        )
    }

    pub fn information(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Information(InformationConfig::default()))
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    /// Set the Run State keys this node reads.
    pub fn with_usage(mut self, keys: &[&str]) -> Self {
        self.usage_fields = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Declare an output field.
    pub fn with_output(mut self, key: impl Into<String>, kind: FieldKind) -> Self {
        self.generate_fields.insert(key.into(), kind);
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Mark input fields of a start node as required. No-op on other kinds.
    pub fn with_required(mut self, keys: &[&str]) -> Self {
        if let NodeKind::Start(ref mut cfg) = self.kind {
            cfg.required = keys.iter().map(|k| k.to_string()).collect();
        }
        self
    }
}
