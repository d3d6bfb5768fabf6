pub mod config;
pub mod error;
pub mod event;
pub mod schema;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowError, GraphError, NodeError, Result, RunError};
pub use event::{EventBus, EventKind, ExecutionEvent, RunStatus, Subscription};
pub use schema::{Edge, ErrorPolicy, FieldKind, Node, NodeKind, NodeType, Workflow};
pub use types::*;
