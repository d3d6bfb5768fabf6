//! Workflow execution engine.
//!
//! `compile` validates a workflow into a `CompiledGraph`; `start_run` (or
//! `WorkflowEngine::start`) executes it over a fresh Run State, streaming
//! `ExecutionEvent`s through the returned `RunHandle`.

pub mod engine;
pub mod executor;
pub mod expr;
pub mod run_log;
mod scheduler;
pub mod state;
pub mod template;
pub mod validator;

pub use engine::{start_run, RunHandle, RunOptions, RunOutcome, WorkflowEngine};
pub use executor::{
    NodeExecutor, NodeExecutorRegistry, NodeInvocation, NodeOutcome, OutputSink, Route,
};
pub use expr::Expr;
pub use run_log::RunLogger;
pub use state::{Patch, RunState};
pub use validator::{compile, CompiledEdge, CompiledGraph};
