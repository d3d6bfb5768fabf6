use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use flowrun_core::error::{NodeErrorKind, RunError};
use flowrun_core::event::{EventKind, RunStatus};
use flowrun_core::schema::{Edge, ErrorPolicy, FieldKind, Node, NodeType, Workflow};
use flowrun_engine::{compile, start_run, NodeExecutorRegistry, WorkflowEngine};
use flowrun_test_utils::*;

fn tools_registry(tools: Arc<ScriptedTools>) -> NodeExecutorRegistry {
    NodeExecutorRegistry::new().with_tools(tools)
}

fn node_error_kind(events: &[flowrun_core::event::ExecutionEvent], node: &str) -> Option<NodeErrorKind> {
    events.iter().find_map(|e| match &e.kind {
        EventKind::NodeError { node_id, error } if node_id == node => Some(error.kind),
        _ => None,
    })
}

#[tokio::test]
async fn linear_run_completes_with_end_output() {
    let wf = Workflow::new(
        "linear",
        vec![
            Node::start("start").with_output("topic", FieldKind::Text),
            Node::tool("lookup", "lookup", Value::Null)
                .with_usage(&["topic"])
                .with_output("facts", FieldKind::Array),
            Node::end("end").with_usage(&["facts"]),
        ],
        vec![Edge::new("start", "lookup"), Edge::new("lookup", "end")],
    );
    let tools = shared(ScriptedTools::new().with("lookup", ToolBehavior::Return(json!(["a", "b"]))));
    let handle = start_run(compile(&wf).unwrap(), input(json!({"topic": "rust"})), tools_registry(tools.clone()));
    let events = collect_events(handle.events()).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.output, Some(json!({"facts": ["a", "b"]})));
    assert_eq!(tools.calls(), vec![("lookup".to_string(), json!({"topic": "rust"}))]);
    assert_eq!(
        event_types(&events),
        vec![
            "WORKFLOW_START",
            "NODE_START(start)",
            "NODE_END(start)",
            "NODE_START(lookup)",
            "NODE_END(lookup)",
            "NODE_START(end)",
            "NODE_END(end)",
            "WORKFLOW_END(COMPLETED)",
        ]
    );
}

#[tokio::test]
async fn merge_waits_only_for_live_branches() {
    // start -> check -(true)-> yes -> join
    //                -(false)-> no -> join
    // join must run once, after `yes`, even though `no` never does.
    let wf = Workflow::new(
        "merge",
        vec![
            Node::start("start"),
            Node::condition("check", "score >= 5"),
            Node::tool("yes", "yes", Value::Null),
            Node::tool("no", "no", Value::Null),
            Node::tool("join", "join", Value::Null),
            Node::end("end"),
        ],
        vec![
            Edge::new("start", "check"),
            Edge::branch("check", "yes", true),
            Edge::branch("check", "no", false),
            Edge::new("yes", "join"),
            Edge::new("no", "join"),
            Edge::new("join", "end"),
        ],
    );
    let tools = shared(
        ScriptedTools::new()
            .with("yes", ToolBehavior::Return(json!("high")))
            .with("no", ToolBehavior::Return(json!("low")))
            .with("join", ToolBehavior::Return(json!("joined"))),
    );
    let handle = start_run(compile(&wf).unwrap(), input(json!({"score": 7})), tools_registry(tools.clone()));
    let events = collect_events(handle.events()).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(started_nodes(&events), vec!["start", "check", "yes", "join", "end"]);
    assert!(!tools.was_called("no"));
    assert!(position(&events, "NODE_END", "yes") < position(&events, "NODE_START", "join"));
    let output = outcome.output.unwrap();
    assert_eq!(output["yes"], json!("high"));
    assert_eq!(output["join"], json!("joined"));
    assert!(output.get("no").is_none());
}

#[tokio::test]
async fn pruning_reaches_exclusive_descendants_only() {
    // start -> check -(true)-> yes -> join -> end
    //                -(false)-> no -> no2 -> join
    //                                  no2 -> deep
    //                           no -> mixed -> end
    // start -> side -> side2 -> mixed
    // The whole false subtree is skipped; `join` and `mixed` still run once
    // their live inbound edges complete.
    let wf = Workflow::new(
        "deep-prune",
        vec![
            Node::start("start"),
            Node::condition("check", "score >= 5"),
            Node::tool("yes", "yes", Value::Null),
            Node::tool("no", "no", Value::Null),
            Node::tool("no2", "no2", Value::Null),
            Node::tool("deep", "deep", Value::Null),
            Node::tool("side", "side", Value::Null),
            Node::tool("side2", "side2", Value::Null),
            Node::tool("mixed", "mixed", Value::Null),
            Node::tool("join", "join", Value::Null),
            Node::end("end").with_usage(&["join", "mixed"]),
        ],
        vec![
            Edge::new("start", "check"),
            Edge::branch("check", "yes", true),
            Edge::branch("check", "no", false),
            Edge::new("yes", "join"),
            Edge::new("no", "no2"),
            Edge::new("no2", "join"),
            Edge::new("no2", "deep"),
            Edge::new("no", "mixed"),
            Edge::new("start", "side"),
            Edge::new("side", "side2"),
            Edge::new("side2", "mixed"),
            Edge::new("join", "end"),
            Edge::new("mixed", "end"),
        ],
    );
    let mut tools = ScriptedTools::new();
    for name in ["yes", "no", "no2", "deep", "side", "side2", "mixed", "join"] {
        tools = tools.with(name, ToolBehavior::Delay(Duration::from_millis(5), json!(name)));
    }
    let tools = shared(tools);
    let handle = start_run(compile(&wf).unwrap(), input(json!({"score": 7})), tools_registry(tools.clone()));
    let events = collect_events(handle.events()).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.output, Some(json!({"join": "join", "mixed": "mixed"})));

    let mut started = started_nodes(&events);
    started.sort();
    assert_eq!(
        started,
        vec!["check", "end", "join", "mixed", "side", "side2", "start", "yes"]
    );
    for pruned in ["no", "no2", "deep"] {
        assert!(position(&events, "NODE_START", pruned).is_none(), "{} must not start", pruned);
        assert!(!tools.was_called(pruned));
    }
    assert!(position(&events, "NODE_END", "yes") < position(&events, "NODE_START", "join"));
    assert!(position(&events, "NODE_END", "side2") < position(&events, "NODE_START", "mixed"));
    assert!(position(&events, "NODE_END", "join") < position(&events, "NODE_START", "end"));
    assert!(position(&events, "NODE_END", "mixed") < position(&events, "NODE_START", "end"));
}

#[tokio::test]
async fn subscriber_can_read_the_run_while_it_runs() {
    let wf = Workflow::new(
        "reentrant",
        vec![
            Node::start("start"),
            Node::tool("slow", "slow", Value::Null),
            Node::end("end"),
        ],
        vec![Edge::new("start", "slow"), Edge::new("slow", "end")],
    );
    let tools = shared(ScriptedTools::new().with("slow", ToolBehavior::Delay(Duration::from_millis(50), json!(1))));
    let handle = Arc::new(start_run(compile(&wf).unwrap(), input(json!({})), tools_registry(tools)));
    let rx = handle.events();

    let cell: Arc<std::sync::OnceLock<std::sync::Weak<flowrun_engine::RunHandle>>> = Arc::default();
    let _ = cell.set(Arc::downgrade(&handle));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let (own, sink) = (cell.clone(), seen.clone());
    let _sub = handle.subscribe(move |event| {
        let history = own.get().and_then(|h| h.upgrade()).map(|h| h.history().len());
        sink.lock().unwrap().push((event.seq, history));
    });

    let events = tokio::time::timeout(Duration::from_secs(3), collect_events(rx))
        .await
        .expect("run stalled behind a subscriber");
    assert_well_formed(&events);
    assert_eq!(handle.wait().await.status, RunStatus::Completed);
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), events.len());
    for (seq, history) in seen {
        assert!(history.unwrap() as u64 > seq);
    }
}

#[tokio::test]
async fn panicking_subscriber_does_not_break_the_run() {
    let wf = Workflow::new(
        "panicky",
        vec![
            Node::start("start"),
            Node::tool("lookup", "lookup", Value::Null),
            Node::end("end"),
        ],
        vec![Edge::new("start", "lookup"), Edge::new("lookup", "end")],
    );
    let tools = shared(ScriptedTools::new().with("lookup", ToolBehavior::Delay(Duration::from_millis(20), json!(1))));
    let handle = start_run(compile(&wf).unwrap(), input(json!({})), tools_registry(tools));
    let _sub = handle.subscribe(|event| {
        if event.type_name() == "NODE_END" && event.node_id() == Some("lookup") {
            panic!("subscriber bug");
        }
    });
    let outcome = handle.wait().await;

    assert_eq!(outcome.status, RunStatus::Completed);
    let history = handle.history();
    assert_well_formed(&history);
    assert_eq!(event_types(&history).last().unwrap(), "WORKFLOW_END(COMPLETED)");
}

#[tokio::test]
async fn false_branch_is_taken_when_predicate_fails() {
    let wf = Workflow::new(
        "branch",
        vec![
            Node::start("start"),
            Node::condition("check", "status == 'open'"),
            Node::tool("yes", "yes", Value::Null),
            Node::tool("no", "no", Value::Null),
        ],
        vec![
            Edge::new("start", "check"),
            Edge::branch("check", "yes", true),
            Edge::branch("check", "no", false),
        ],
    );
    let tools = shared(
        ScriptedTools::new()
            .with("yes", ToolBehavior::Return(json!(1)))
            .with("no", ToolBehavior::Return(json!(2))),
    );
    let handle = start_run(compile(&wf).unwrap(), input(json!({"status": "closed"})), tools_registry(tools.clone()));
    let events = collect_events(handle.events()).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(nodes_with(&events, "NODE_END"), vec!["start", "check", "no"]);
    assert!(!tools.was_called("yes"));
    // No end node: the output is the final Run State.
    assert_eq!(outcome.output.unwrap()["no"], json!(2));
}

#[tokio::test]
async fn continue_on_error_prunes_successors_and_completes() {
    // start -> flaky -> after
    //       -> steady
    let wf = Workflow::new(
        "lenient",
        vec![
            Node::start("start"),
            Node::tool("flaky", "flaky", Value::Null).with_error_policy(ErrorPolicy::ContinueOnError),
            Node::tool("after", "after", Value::Null),
            Node::tool("steady", "steady", Value::Null),
        ],
        vec![
            Edge::new("start", "flaky"),
            Edge::new("flaky", "after"),
            Edge::new("start", "steady"),
        ],
    );
    let tools = shared(
        ScriptedTools::new()
            .with("flaky", ToolBehavior::Fail("upstream 503".into()))
            .with("after", ToolBehavior::Return(json!("never")))
            .with("steady", ToolBehavior::Return(json!("ok"))),
    );
    let handle = start_run(compile(&wf).unwrap(), input(json!({})), tools_registry(tools.clone()));
    let events = collect_events(handle.events()).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(node_error_kind(&events, "flaky"), Some(NodeErrorKind::ExecutorFailure));
    assert!(!tools.was_called("after"));
    assert!(position(&events, "NODE_START", "after").is_none());
    assert_eq!(outcome.output.unwrap()["steady"], json!("ok"));
}

#[tokio::test]
async fn abort_policy_fails_the_run() {
    let wf = Workflow::new(
        "strict",
        vec![
            Node::start("start"),
            Node::tool("broken", "broken", Value::Null),
            Node::end("end"),
        ],
        vec![Edge::new("start", "broken"), Edge::new("broken", "end")],
    );
    let tools = shared(ScriptedTools::new().with("broken", ToolBehavior::Fail("boom".into())));
    let handle = start_run(compile(&wf).unwrap(), input(json!({})), tools_registry(tools));
    let events = collect_events(handle.events()).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.output.is_none());
    match outcome.error {
        Some(RunError::NodeFailed(err)) => {
            assert_eq!(err.node_id(), "broken");
            assert_eq!(err.kind(), NodeErrorKind::ExecutorFailure);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(position(&events, "NODE_START", "end").is_none());
    assert_eq!(handle.status(), RunStatus::Failed);
}

#[tokio::test]
async fn end_node_cancels_running_siblings() {
    let wf = Workflow::new(
        "race",
        vec![
            Node::start("start"),
            Node::tool("slow", "slow", Value::Null),
            Node::end("end"),
        ],
        vec![Edge::new("start", "slow"), Edge::new("start", "end")],
    );
    let tools = shared(ScriptedTools::new().with("slow", ToolBehavior::Hang));
    let handle = start_run(compile(&wf).unwrap(), input(json!({"q": 1})), tools_registry(tools));
    let events = collect_events(handle.events()).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.output, Some(json!({"q": 1})));
    assert_eq!(node_error_kind(&events, "slow"), Some(NodeErrorKind::Cancelled));
    assert!(position(&events, "NODE_END", "end") < position(&events, "NODE_ERROR", "slow"));
}

#[tokio::test]
async fn node_deadline_becomes_timeout_error() {
    let wf = Workflow::new(
        "deadline",
        vec![
            Node::start("start"),
            Node::tool("stuck", "stuck", Value::Null).with_timeout(1),
        ],
        vec![Edge::new("start", "stuck")],
    );
    let tools = shared(ScriptedTools::new().with("stuck", ToolBehavior::Hang));
    let handle = start_run(compile(&wf).unwrap(), input(json!({})), tools_registry(tools));
    let events = collect_events(handle.events()).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(node_error_kind(&events, "stuck"), Some(NodeErrorKind::Timeout));
}

#[tokio::test]
async fn missing_executor_is_a_node_failure() {
    let wf = Workflow::new(
        "no-llm",
        vec![Node::start("start"), Node::llm("ask", "hi"), Node::end("end")],
        vec![Edge::new("start", "ask"), Edge::new("ask", "end")],
    );
    let handle = start_run(compile(&wf).unwrap(), input(json!({})), NodeExecutorRegistry::new());
    let events = collect_events(handle.events()).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.status, RunStatus::Failed);
    let message = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::NodeError { error, .. } => Some(error.message.clone()),
            _ => None,
        })
        .unwrap();
    assert!(message.contains("no executor registered for node type llm"));
}

#[tokio::test]
async fn parallel_branches_run_concurrently() {
    let wf = Workflow::new(
        "fanout",
        vec![
            Node::start("start"),
            Node::tool("a", "a", Value::Null),
            Node::tool("b", "b", Value::Null),
            Node::end("end").with_usage(&["a", "b"]),
        ],
        vec![
            Edge::new("start", "a"),
            Edge::new("start", "b"),
            Edge::new("a", "end"),
            Edge::new("b", "end"),
        ],
    );
    let delay = Duration::from_millis(300);
    let tools = shared(
        ScriptedTools::new()
            .with("a", ToolBehavior::Delay(delay, json!("A")))
            .with("b", ToolBehavior::Delay(delay, json!("B"))),
    );
    let started = Instant::now();
    let handle = start_run(compile(&wf).unwrap(), input(json!({})), tools_registry(tools));
    let outcome = handle.wait().await;

    assert!(started.elapsed() < Duration::from_millis(550), "branches ran sequentially");
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.output, Some(json!({"a": "A", "b": "B"})));
    assert_well_formed(&handle.history());
}

#[tokio::test]
async fn cancel_stops_run_and_reports_in_flight_nodes() {
    let wf = Workflow::new(
        "cancel",
        vec![
            Node::start("start"),
            Node::llm("ask", "Tell me everything"),
            Node::end("end"),
        ],
        vec![Edge::new("start", "ask"), Edge::new("ask", "end")],
    );
    let llm = shared(ScriptedLlm::hanging());
    let executors = NodeExecutorRegistry::new().with_llm(llm, flowrun_core::config::ModelConfig::new("m"));
    let handle = start_run(compile(&wf).unwrap(), input(json!({})), executors);
    let rx = handle.events();

    while position(&handle.history(), "NODE_START", "ask").is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.cancel();
    let events = collect_events(rx).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(outcome.error, Some(RunError::Cancelled));
    assert_eq!(node_error_kind(&events, "ask"), Some(NodeErrorKind::Cancelled));
    assert!(position(&events, "NODE_START", "end").is_none());
    assert_eq!(event_types(&events).last().unwrap(), "WORKFLOW_END(CANCELLED)");
}

#[tokio::test]
async fn cancelled_before_start_runs_nothing() {
    let wf = Workflow::new(
        "early",
        vec![Node::start("start"), Node::end("end")],
        vec![Edge::new("start", "end")],
    );
    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();
    let engine = WorkflowEngine::new(NodeExecutorRegistry::new());
    let handle = engine.start_with(
        engine.compile(&wf).unwrap(),
        input(json!({})),
        flowrun_engine::RunOptions {
            run_id: Some("run-early".into()),
            cancel: Some(token),
        },
    );
    let outcome = handle.wait().await;

    assert_eq!(outcome.run_id, "run-early");
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(
        event_types(&handle.history()),
        vec!["WORKFLOW_START", "WORKFLOW_END(CANCELLED)"]
    );
}

#[tokio::test]
async fn llm_chunks_stream_as_node_output() {
    let wf = Workflow::new(
        "stream",
        vec![
            Node::start("start").with_output("name", FieldKind::Text),
            Node::llm("greet", "Say hello to {{name}}").with_output("greeting", FieldKind::Text),
            Node::end("end").with_usage(&["greeting"]),
        ],
        vec![Edge::new("start", "greet"), Edge::new("greet", "end")],
    );
    let llm = shared(ScriptedLlm::new(&["Hello, ", "Ada", "!"]));
    let executors = NodeExecutorRegistry::new().with_llm(llm.clone(), flowrun_core::config::ModelConfig::new("m"));
    let handle = start_run(compile(&wf).unwrap(), input(json!({"name": "Ada"})), executors);
    let events = collect_events(handle.events()).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.output, Some(json!({"greeting": "Hello, Ada!"})));
    let deltas: Vec<Value> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::NodeOutput { data, .. } => Some(data["delta"].clone()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec![json!("Hello, "), json!("Ada"), json!("!")]);
    let calls = llm.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].last().unwrap().content.contains("Say hello to Ada"));
}

#[tokio::test]
async fn late_subscriber_sees_full_history() {
    let wf = Workflow::new(
        "late",
        vec![Node::start("start"), Node::end("end")],
        vec![Edge::new("start", "end")],
    );
    let handle = start_run(compile(&wf).unwrap(), input(json!({})), NodeExecutorRegistry::new());
    handle.wait().await;

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = handle.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
    let seen = seen.lock().unwrap().clone();

    assert_eq!(seen, handle.history());
    assert_well_formed(&seen);
    let node_types: Vec<NodeType> = seen
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::NodeStart { node_type, .. } => Some(*node_type),
            _ => None,
        })
        .collect();
    assert_eq!(node_types, vec![NodeType::Start, NodeType::End]);
}

#[tokio::test]
async fn start_validation_rejects_missing_required_input() {
    let wf = Workflow::new(
        "required",
        vec![Node::start("start").with_required(&["topic"]), Node::end("end")],
        vec![Edge::new("start", "end")],
    );
    let handle = start_run(compile(&wf).unwrap(), input(json!({})), NodeExecutorRegistry::new());
    let events = collect_events(handle.events()).await;
    let outcome = handle.wait().await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(node_error_kind(&events, "start"), Some(NodeErrorKind::Validation));
}

#[tokio::test]
async fn run_log_is_written_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let wf = Workflow::new(
        "logged",
        vec![Node::start("start"), Node::end("end")],
        vec![Edge::new("start", "end")],
    );
    let engine = WorkflowEngine::new(NodeExecutorRegistry::new()).with_run_log(dir.path().to_path_buf(), 2);
    let handle = engine.start(engine.compile(&wf).unwrap(), input(json!({})));
    let run_id = handle.run_id().to_string();
    handle.wait().await;

    let path = dir.path().join("logged").join(format!("{}.jsonl", run_id));
    let mut lines = 0;
    for _ in 0..100 {
        if let Ok(content) = std::fs::read_to_string(&path) {
            lines = content.lines().count();
            if lines == 6 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(lines, 6);
}

#[tokio::test]
async fn run_log_stays_inside_log_dir_for_hostile_workflow_ids() {
    let root = tempfile::tempdir().unwrap();
    let log_dir = root.path().join("logs");
    let wf = Workflow::new(
        "../escaped",
        vec![Node::start("start"), Node::end("end")],
        vec![Edge::new("start", "end")],
    );
    let engine = WorkflowEngine::new(NodeExecutorRegistry::new()).with_run_log(log_dir.clone(), 2);
    let handle = engine.start(engine.compile(&wf).unwrap(), input(json!({})));
    let run_id = handle.run_id().to_string();
    handle.wait().await;

    let path = log_dir.join("___escaped").join(format!("{}.jsonl", run_id));
    for _ in 0..100 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(path.exists());
    assert!(!root.path().join("escaped").exists());
}
