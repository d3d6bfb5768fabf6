use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{NodeError, NodeErrorKind};
use crate::schema::NodeType;

/// Lifecycle of a run. `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Error detail carried by `NODE_ERROR`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeErrorInfo {
    pub kind: NodeErrorKind,
    pub message: String,
}

impl From<&NodeError> for NodeErrorInfo {
    fn from(err: &NodeError) -> Self {
        Self {
            kind: err.kind(),
            message: err.message(),
        }
    }
}

/// What happened. Serialized with a SCREAMING_SNAKE_CASE `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum EventKind {
    WorkflowStart {
        workflow_id: String,
    },
    NodeStart {
        node_id: String,
        node_type: NodeType,
        name: String,
    },
    /// Partial output while a node is running (e.g. streamed tokens).
    NodeOutput {
        node_id: String,
        data: serde_json::Value,
    },
    NodeEnd {
        node_id: String,
        output: serde_json::Value,
        elapsed_ms: u64,
    },
    NodeError {
        node_id: String,
        error: NodeErrorInfo,
    },
    WorkflowEnd {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        elapsed_ms: u64,
    },
}

impl EventKind {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStart { node_id, .. }
            | Self::NodeOutput { node_id, .. }
            | Self::NodeEnd { node_id, .. }
            | Self::NodeError { node_id, .. } => Some(node_id),
            Self::WorkflowStart { .. } | Self::WorkflowEnd { .. } => None,
        }
    }

    /// The wire name of this event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::WorkflowStart { .. } => "WORKFLOW_START",
            Self::NodeStart { .. } => "NODE_START",
            Self::NodeOutput { .. } => "NODE_OUTPUT",
            Self::NodeEnd { .. } => "NODE_END",
            Self::NodeError { .. } => "NODE_ERROR",
            Self::WorkflowEnd { .. } => "WORKFLOW_END",
        }
    }
}

/// One entry in a run's event sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub run_id: String,
    /// Position in the run's sequence, starting at 0.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ExecutionEvent {
    pub fn node_id(&self) -> Option<&str> {
        self.kind.node_id()
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

type Callback = Arc<dyn Fn(&ExecutionEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: Callback,
    /// Index into the history of the next event to deliver.
    cursor: usize,
}

#[derive(Default)]
struct BusInner {
    history: Vec<ExecutionEvent>,
    subscribers: Vec<Subscriber>,
    /// Nodes whose terminal event has been published.
    sealed: HashSet<String>,
    closed: bool,
    /// Set while some caller is delivering events to subscribers.
    draining: bool,
    next_seq: u64,
    next_subscriber: u64,
}

/// Per-run event bus.
///
/// Sequence numbers are assigned under the bus lock, and each subscriber
/// receives events strictly in sequence order. Callbacks run without the lock
/// held, so they may call back into the bus; events published from inside a
/// callback are delivered after the current one. The bus keeps the run's
/// history: late subscribers get a replay first, then live events. Once
/// `WORKFLOW_END` is published the bus is closed and drops all subscribers;
/// once a node's `NODE_END`/`NODE_ERROR` is published, further `NODE_OUTPUT`
/// for that node is dropped. A callback that panics is unsubscribed.
pub struct EventBus {
    run_id: String,
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            inner: Mutex::new(BusInner::default()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish an event. Returns `false` if the bus refused it.
    pub fn publish(&self, kind: EventKind) -> bool {
        {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            match &kind {
                EventKind::NodeOutput { node_id, .. } if inner.sealed.contains(node_id) => {
                    return false;
                }
                EventKind::NodeEnd { node_id, .. } | EventKind::NodeError { node_id, .. } => {
                    if !inner.sealed.insert(node_id.clone()) {
                        return false;
                    }
                }
                EventKind::WorkflowEnd { .. } => inner.closed = true,
                _ => {}
            }

            let event = ExecutionEvent {
                run_id: self.run_id.clone(),
                seq: inner.next_seq,
                timestamp: Utc::now(),
                kind,
            };
            inner.next_seq += 1;
            inner.history.push(event);
        }

        self.deliver();
        true
    }

    /// Register a callback. It first receives every event published so far.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&ExecutionEvent) + Send + Sync + 'static,
    {
        let id = {
            let mut inner = self.lock();
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.push(Subscriber {
                id,
                callback: Arc::new(callback),
                cursor: 0,
            });
            id
        };
        self.deliver();
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Hand every subscriber the events it has not seen yet.
    ///
    /// Only one caller delivers at a time; anyone arriving while delivery is
    /// in progress leaves their events to the active deliverer.
    fn deliver(&self) {
        {
            let mut inner = self.lock();
            if inner.draining {
                return;
            }
            inner.draining = true;
        }

        loop {
            let batch: Vec<(u64, Callback, Vec<ExecutionEvent>)> = {
                let mut inner = self.lock();
                let BusInner {
                    history,
                    subscribers,
                    ..
                } = &mut *inner;
                let len = history.len();
                let batch: Vec<_> = subscribers
                    .iter_mut()
                    .filter(|sub| sub.cursor < len)
                    .map(|sub| {
                        let pending = history[sub.cursor..].to_vec();
                        sub.cursor = len;
                        (sub.id, sub.callback.clone(), pending)
                    })
                    .collect();

                if batch.is_empty() {
                    inner.draining = false;
                    if inner.closed {
                        inner.subscribers.clear();
                    }
                    return;
                }
                batch
            };

            for (id, callback, events) in batch {
                for event in &events {
                    let delivered = catch_unwind(AssertUnwindSafe(|| callback(event)));
                    if delivered.is_err() {
                        warn!(run_id = %self.run_id, subscriber = id, "Event subscriber panicked, unsubscribing");
                        self.remove(id);
                        break;
                    }
                }
            }
        }
    }

    /// Receive the run's events as a channel. The channel closes after
    /// `WORKFLOW_END`.
    pub fn stream(self: &Arc<Self>) -> mpsc::UnboundedReceiver<ExecutionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Subscription handle is dropped; the sender lives until the bus closes.
        let _ = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Everything published so far.
    pub fn history(&self) -> Vec<ExecutionEvent> {
        self.lock().history.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn remove(&self, id: u64) {
        self.lock().subscribers.retain(|sub| sub.id != id);
    }
}

/// Handle returned by `EventBus::subscribe`. Dropping it keeps the
/// subscription alive; call `unsubscribe` to stop receiving events.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<EventBus>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}
