use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use flowrun_core::config::EngineConfig;
use flowrun_core::error::{GraphError, RunError};
use flowrun_core::event::{EventBus, ExecutionEvent, RunStatus, Subscription};
use flowrun_core::schema::Workflow;
use flowrun_core::types::RunId;

use crate::executor::NodeExecutorRegistry;
use crate::run_log::RunLogger;
use crate::scheduler::Scheduler;
use crate::validator::{compile, CompiledGraph};

/// Final result of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    /// Workflow output, set when the run completed.
    pub output: Option<Value>,
    /// Why the run did not complete.
    pub error: Option<RunError>,
}

/// Handle to a running workflow.
///
/// Dropping the handle does not stop the run; call `cancel`.
pub struct RunHandle {
    run_id: String,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
    status: watch::Receiver<RunStatus>,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Receive every event of the run, starting with those already
    /// published.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ExecutionEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(callback)
    }

    /// The run's events as a channel that closes after `WORKFLOW_END`.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ExecutionEvent> {
        self.bus.stream()
    }

    /// Events published so far.
    pub fn history(&self) -> Vec<ExecutionEvent> {
        self.bus.history()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The token that cancels this run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Wait for the run to finish.
    pub async fn wait(&self) -> RunOutcome {
        let mut rx = self.outcome.clone();
        let result = rx.wait_for(Option::is_some).await.map(|o| (*o).clone());
        match result {
            Ok(Some(outcome)) => outcome,
            _ => RunOutcome {
                run_id: self.run_id.clone(),
                status: RunStatus::Failed,
                output: None,
                error: Some(RunError::Interrupted(
                    "run task ended without an outcome".to_string(),
                )),
            },
        }
    }
}

/// Per-run settings.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run id to use instead of a fresh UUID.
    pub run_id: Option<String>,
    /// Caller-owned cancellation token.
    pub cancel: Option<CancellationToken>,
}

/// Start a run with default engine settings. Must be called inside a tokio
/// runtime.
pub fn start_run(
    graph: CompiledGraph,
    input: HashMap<String, Value>,
    executors: NodeExecutorRegistry,
) -> RunHandle {
    spawn_run(
        Arc::new(graph),
        input,
        executors,
        RunOptions::default(),
        Duration::from_millis(EngineConfig::default().end_grace_ms),
    )
}

fn spawn_run(
    graph: Arc<CompiledGraph>,
    input: HashMap<String, Value>,
    executors: NodeExecutorRegistry,
    options: RunOptions,
    end_grace: Duration,
) -> RunHandle {
    let run_id = options.run_id.unwrap_or_else(|| RunId::new().to_string());
    let cancel = options.cancel.unwrap_or_default();
    let bus = Arc::new(EventBus::new(run_id.clone()));
    let (status_tx, status_rx) = watch::channel(RunStatus::Pending);
    let (outcome_tx, outcome_rx) = watch::channel(None);

    let scheduler = Scheduler::new(graph, input, executors, bus.clone(), cancel.clone(), end_grace);
    tokio::spawn(async move {
        let outcome = scheduler.run(&status_tx).await;
        outcome_tx.send_replace(Some(outcome));
    });

    RunHandle {
        run_id,
        bus,
        cancel,
        status: status_rx,
        outcome: outcome_rx,
    }
}

/// Compiles workflows and starts runs with a fixed executor registry.
#[derive(Clone)]
pub struct WorkflowEngine {
    config: EngineConfig,
    executors: NodeExecutorRegistry,
    run_log: Option<(PathBuf, u8)>,
}

impl WorkflowEngine {
    pub fn new(executors: NodeExecutorRegistry) -> Self {
        Self {
            config: EngineConfig::default(),
            executors,
            run_log: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Write every run as JSONL under `log_dir`.
    pub fn with_run_log(mut self, log_dir: PathBuf, level: u8) -> Self {
        self.run_log = Some((log_dir, level));
        self
    }

    pub fn executors(&self) -> &NodeExecutorRegistry {
        &self.executors
    }

    pub fn compile(&self, workflow: &Workflow) -> Result<CompiledGraph, GraphError> {
        compile(workflow)
    }

    pub fn start(&self, graph: impl Into<Arc<CompiledGraph>>, input: HashMap<String, Value>) -> RunHandle {
        self.start_with(graph, input, RunOptions::default())
    }

    pub fn start_with(
        &self,
        graph: impl Into<Arc<CompiledGraph>>,
        input: HashMap<String, Value>,
        options: RunOptions,
    ) -> RunHandle {
        let graph = graph.into();
        let workflow_id = graph.workflow_id().to_string();
        let handle = spawn_run(
            graph,
            input,
            self.executors.clone(),
            options,
            Duration::from_millis(self.config.end_grace_ms),
        );

        if let Some((dir, level)) = &self.run_log {
            let logger = RunLogger::new(dir.clone(), *level);
            tokio::spawn(logger.run(handle.events(), workflow_id, handle.run_id().to_string()));
        }
        handle
    }
}
