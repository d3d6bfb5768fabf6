//! Scheduler: drives one run of a compiled graph.
//!
//! Readiness is tracked per edge. An edge starts `Pending` and becomes
//! `Taken` when its source completes and activates it, or `Skipped` when its
//! source is pruned, fails under `continueOnError`, or is a condition node
//! that chose the other branch. A node is ready once none of its inbound
//! edges is pending and at least one was taken. A node whose inbound edges
//! were all skipped is pruned, and the skip flows on to its own successors.
//! A merge node therefore waits exactly for the predecessors that can still
//! run.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowrun_core::error::{NodeError, RunError};
use flowrun_core::event::{EventBus, EventKind, NodeErrorInfo, RunStatus};
use flowrun_core::schema::{ErrorPolicy, NodeType};

use crate::engine::RunOutcome;
use crate::executor::{NodeExecutor, NodeExecutorRegistry, NodeInvocation, NodeOutcome, OutputSink, Route};
use crate::state::RunState;
use crate::validator::CompiledGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Pending,
    Taken,
    Skipped,
}

/// Why the run stopped before the graph drained.
enum Termination {
    Finished(Value),
    Failed(NodeError),
    Cancelled,
}

enum Wake {
    Cancelled,
    Joined(Option<Result<(TaskId, TaskResult), JoinError>>),
}

type TaskResult = (String, Result<NodeOutcome, NodeError>, u64);

pub(crate) struct Scheduler {
    graph: Arc<CompiledGraph>,
    executors: NodeExecutorRegistry,
    state: RunState,
    bus: Arc<EventBus>,
    /// Signalled by the caller.
    run_cancel: CancellationToken,
    /// Parent of every node token; fired when the run terminates early.
    node_cancel: CancellationToken,
    end_grace: Duration,
    edges: Vec<EdgeState>,
    /// Nodes already queued, started or pruned.
    resolved: HashSet<String>,
    in_flight: BTreeSet<String>,
    tasks: JoinSet<TaskResult>,
    /// Node id of every spawned task, so a task that dies still resolves
    /// its node.
    task_nodes: HashMap<TaskId, String>,
    input: Option<HashMap<String, Value>>,
}

impl Scheduler {
    pub(crate) fn new(
        graph: Arc<CompiledGraph>,
        input: HashMap<String, Value>,
        executors: NodeExecutorRegistry,
        bus: Arc<EventBus>,
        run_cancel: CancellationToken,
        end_grace: Duration,
    ) -> Self {
        let edges = vec![EdgeState::Pending; graph.edge_count()];
        Self {
            node_cancel: run_cancel.child_token(),
            graph,
            executors,
            state: RunState::new(),
            bus,
            run_cancel,
            end_grace,
            edges,
            resolved: HashSet::new(),
            in_flight: BTreeSet::new(),
            tasks: JoinSet::new(),
            task_nodes: HashMap::new(),
            input: Some(input),
        }
    }

    /// Execute the run to its terminal state. Publishes `WORKFLOW_END` last.
    pub(crate) async fn run(mut self, status: &watch::Sender<RunStatus>) -> RunOutcome {
        let started = Instant::now();
        let run_id = self.bus.run_id().to_string();
        info!(run_id = %run_id, workflow_id = %self.graph.workflow_id(), "Run started");

        self.bus.publish(EventKind::WorkflowStart {
            workflow_id: self.graph.workflow_id().to_string(),
        });
        status.send_replace(RunStatus::Running);

        let start = self.graph.start().to_string();
        self.resolved.insert(start.clone());
        let mut ready = VecDeque::from([start]);

        let termination = loop {
            if self.run_cancel.is_cancelled() {
                break Some(Termination::Cancelled);
            }
            while let Some(node_id) = ready.pop_front() {
                if self.run_cancel.is_cancelled() {
                    break;
                }
                self.dispatch(node_id).await;
            }
            if self.run_cancel.is_cancelled() {
                continue;
            }
            if self.tasks.is_empty() {
                break None;
            }

            let wake = tokio::select! {
                biased;
                _ = self.run_cancel.cancelled() => Wake::Cancelled,
                joined = self.tasks.join_next_with_id() => Wake::Joined(joined),
            };

            match wake {
                Wake::Cancelled => break Some(Termination::Cancelled),
                Wake::Joined(None) => break None,
                Wake::Joined(Some(joined)) => {
                    if let Some(t) = self.joined(joined, &mut ready).await {
                        break Some(t);
                    }
                }
            }
        };

        if termination.is_some() {
            self.wind_down().await;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (status_value, output, error) = match termination {
            None => (RunStatus::Completed, Some(self.state.to_value().await), None),
            Some(Termination::Finished(output)) => (RunStatus::Completed, Some(output), None),
            Some(Termination::Failed(err)) => (RunStatus::Failed, None, Some(RunError::NodeFailed(err))),
            Some(Termination::Cancelled) => (RunStatus::Cancelled, None, Some(RunError::Cancelled)),
        };

        self.bus.publish(EventKind::WorkflowEnd {
            status: status_value,
            output: output.clone(),
            error: error.as_ref().map(|e| e.to_string()),
            elapsed_ms,
        });
        status.send_replace(status_value);

        match status_value {
            RunStatus::Completed => info!(run_id = %run_id, elapsed_ms, "Run completed"),
            other => warn!(run_id = %run_id, status = ?other, elapsed_ms, "Run did not complete"),
        }

        RunOutcome {
            run_id,
            status: status_value,
            output,
            error,
        }
    }

    async fn dispatch(&mut self, node_id: String) {
        let Some(node) = self.graph.node(&node_id).cloned() else {
            error!(node_id = %node_id, "Ready node missing from graph");
            return;
        };
        let node_type = node.node_type();

        self.bus.publish(EventKind::NodeStart {
            node_id: node_id.clone(),
            node_type,
            name: node.name.clone(),
        });
        self.in_flight.insert(node_id.clone());
        debug!(node_id = %node_id, node_type = %node_type, "Dispatching node");

        let input = if node_type == NodeType::Start {
            self.input.take().unwrap_or_default()
        } else if node.usage_fields.is_empty() {
            self.state.snapshot().await
        } else {
            self.state.read(&node.usage_fields).await
        };

        let cancel = self.node_cancel.child_token();
        let invocation = NodeInvocation {
            output: OutputSink::new(self.bus.clone(), node_id.clone()),
            condition: self.graph.condition(&node_id).cloned(),
            cancel: cancel.clone(),
            node,
            input,
        };
        let executor = self.executors.get(node_type);

        let node_key = node_id.clone();
        let handle = self.tasks.spawn(async move {
            let started = Instant::now();
            let result = match executor {
                Some(executor) => AssertUnwindSafe(run_executor(executor, invocation, cancel))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(NodeError::failure(&node_id, "executor panicked"))),
                None => Err(NodeError::failure(
                    &node_id,
                    format!("no executor registered for node type {}", node_type),
                )),
            };
            (node_id, result, started.elapsed().as_millis() as u64)
        });
        self.task_nodes.insert(handle.id(), node_key);
    }

    /// Resolve a finished task. A task that panicked outside the executor or
    /// was aborted counts as a failure of its node.
    async fn joined(
        &mut self,
        joined: Result<(TaskId, TaskResult), JoinError>,
        ready: &mut VecDeque<String>,
    ) -> Option<Termination> {
        match joined {
            Ok((id, (node_id, result, elapsed_ms))) => {
                self.task_nodes.remove(&id);
                self.complete(node_id, result, elapsed_ms, ready).await
            }
            Err(e) => {
                let Some(node_id) = self.task_nodes.remove(&e.id()) else {
                    error!(error = %e, "Unknown node task ended abnormally");
                    return None;
                };
                error!(node_id = %node_id, error = %e, "Node task ended abnormally");
                let err = NodeError::failure(&node_id, format!("node task ended abnormally: {}", e));
                self.complete(node_id, Err(err), 0, ready).await
            }
        }
    }

    async fn complete(
        &mut self,
        node_id: String,
        result: Result<NodeOutcome, NodeError>,
        elapsed_ms: u64,
        ready: &mut VecDeque<String>,
    ) -> Option<Termination> {
        self.in_flight.remove(&node_id);

        match result {
            Ok(outcome) => {
                self.state.write(outcome.patch).await;
                self.bus.publish(EventKind::NodeEnd {
                    node_id: node_id.clone(),
                    output: outcome.output,
                    elapsed_ms,
                });
                debug!(node_id = %node_id, elapsed_ms, "Node complete");

                match outcome.route {
                    Route::Finish(output) => return Some(Termination::Finished(output)),
                    Route::All => self.settle_outgoing(&node_id, |_| true, ready),
                    Route::Branch(taken) => {
                        let label = taken.to_string();
                        self.settle_outgoing(&node_id, |handle| handle == Some(label.as_str()), ready)
                    }
                }
                None
            }
            Err(err) => {
                warn!(node_id = %node_id, error = %err, "Node failed");
                self.bus.publish(EventKind::NodeError {
                    node_id: node_id.clone(),
                    error: NodeErrorInfo::from(&err),
                });

                let policy = self
                    .graph
                    .node(&node_id)
                    .map(|n| n.on_error)
                    .unwrap_or_default();
                match policy {
                    ErrorPolicy::AbortWorkflow => Some(Termination::Failed(err)),
                    ErrorPolicy::ContinueOnError => {
                        self.settle_outgoing(&node_id, |_| false, ready);
                        None
                    }
                }
            }
        }
    }

    /// Mark the outgoing edges of a finished node and queue whatever became
    /// ready. Pruning cascades through nodes left with no taken inbound edge.
    fn settle_outgoing<F>(&mut self, node_id: &str, take: F, ready: &mut VecDeque<String>)
    where
        F: Fn(Option<&str>) -> bool,
    {
        let graph = self.graph.clone();
        let mut worklist = Vec::new();
        for &idx in graph.outgoing(node_id) {
            let edge = graph.edge(idx);
            self.edges[idx] = if take(edge.handle.as_deref()) {
                EdgeState::Taken
            } else {
                EdgeState::Skipped
            };
            worklist.push(edge.target.as_str());
        }

        while let Some(target) = worklist.pop() {
            if self.resolved.contains(target) {
                continue;
            }
            let incoming = graph.incoming(target);
            if incoming.iter().any(|&i| self.edges[i] == EdgeState::Pending) {
                continue;
            }
            self.resolved.insert(target.to_string());

            if incoming.iter().any(|&i| self.edges[i] == EdgeState::Taken) {
                ready.push_back(target.to_string());
            } else {
                debug!(node_id = %target, "Node pruned");
                for &idx in graph.outgoing(target) {
                    self.edges[idx] = EdgeState::Skipped;
                    worklist.push(graph.edge(idx).target.as_str());
                }
            }
        }
    }

    /// Stop everything still running: signal the nodes, give them the grace
    /// period, abort the rest, and report each as cancelled.
    async fn wind_down(&mut self) {
        self.node_cancel.cancel();

        if !self.tasks.is_empty() {
            let tasks = &mut self.tasks;
            let drained = tokio::time::timeout(self.end_grace, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                debug!(remaining = self.tasks.len(), "Aborting nodes past the grace period");
                self.tasks.abort_all();
            }
        }

        for node_id in std::mem::take(&mut self.in_flight) {
            let err = NodeError::cancelled(&node_id);
            self.bus.publish(EventKind::NodeError {
                node_id,
                error: NodeErrorInfo::from(&err),
            });
        }
    }
}

/// Run one executor under the node's cancellation token and optional
/// deadline.
async fn run_executor(
    executor: Arc<dyn NodeExecutor>,
    invocation: NodeInvocation,
    cancel: CancellationToken,
) -> Result<NodeOutcome, NodeError> {
    let node_id = invocation.node.id.clone();
    let timeout_secs = invocation.node.timeout_secs;
    let work = executor.execute(invocation);

    let bounded = async {
        match timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), work)
                .await
                .unwrap_or_else(|_| {
                    Err(NodeError::Timeout {
                        node_id: node_id.clone(),
                        timeout_secs: secs,
                    })
                }),
            None => work.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(NodeError::cancelled(&node_id)),
        result = bounded => result,
    }
}
