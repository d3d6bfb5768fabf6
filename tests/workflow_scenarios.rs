//! End-to-end runs of workflows loaded from their JSON form.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use flowrun_core::config::{EngineConfig, ModelConfig};
use flowrun_core::error::{GraphError, NodeErrorKind};
use flowrun_core::event::{EventKind, RunStatus};
use flowrun_core::schema::Workflow;
use flowrun_engine::{NodeExecutorRegistry, WorkflowEngine};
use flowrun_test_utils::*;

fn engine(llm: Arc<ScriptedLlm>, tools: Arc<ScriptedTools>) -> WorkflowEngine {
    let executors = NodeExecutorRegistry::new()
        .with_llm(llm, ModelConfig::new("scripted"))
        .with_tools(tools);
    WorkflowEngine::new(executors).with_config(EngineConfig { end_grace_ms: 100 })
}

fn workflow(value: Value) -> Workflow {
    Workflow::from_json(&value.to_string()).expect("workflow json")
}

#[tokio::test]
async fn greeting_streams_through_llm_node() {
    let wf = workflow(json!({
        "id": "hello",
        "nodes": [
            {"id": "start", "type": "start"},
            {"id": "llm", "type": "llm", "prompt": "say hi"},
            {"id": "end", "type": "end", "usageFields": ["llm"]}
        ],
        "edges": [
            {"source": "start", "target": "llm"},
            {"source": "llm", "target": "end"}
        ]
    }));
    let llm = shared(ScriptedLlm::new(&["h", "i"]));
    let engine = engine(llm.clone(), shared(ScriptedTools::new()));
    let handle = engine.start(engine.compile(&wf).unwrap(), input(json!({})));
    let events = collect_events(handle.events()).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.output, Some(json!({"llm": "hi"})));
    assert_eq!(
        event_types(&events),
        vec![
            "WORKFLOW_START",
            "NODE_START(start)",
            "NODE_END(start)",
            "NODE_START(llm)",
            "NODE_OUTPUT(llm)",
            "NODE_OUTPUT(llm)",
            "NODE_END(llm)",
            "NODE_START(end)",
            "NODE_END(end)",
            "WORKFLOW_END(COMPLETED)",
        ]
    );
    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn false_predicate_dispatches_only_the_false_branch() {
    let wf = workflow(json!({
        "id": "branching",
        "nodes": [
            {"id": "start", "type": "start"},
            {"id": "check", "type": "condition", "expression": "score > 10"},
            {"id": "llmA", "type": "llm", "prompt": "A"},
            {"id": "llmB", "type": "llm", "prompt": "B"},
            {"id": "end", "type": "end", "usageFields": ["llmA", "llmB"]}
        ],
        "edges": [
            {"source": "start", "target": "check"},
            {"source": "check", "target": "llmA", "sourceHandle": "true"},
            {"source": "check", "target": "llmB", "sourceHandle": "false"},
            {"source": "llmA", "target": "end"},
            {"source": "llmB", "target": "end"}
        ]
    }));
    let llm = shared(ScriptedLlm::new(&["from B"]));
    let engine = engine(llm.clone(), shared(ScriptedTools::new()));
    let handle = engine.start(engine.compile(&wf).unwrap(), input(json!({"score": 3})));
    let events = collect_events(handle.events()).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(position(&events, "NODE_START", "llmA").is_none());
    assert!(position(&events, "NODE_END", "llmB") < position(&events, "NODE_START", "end"));
    assert_eq!(llm.call_count(), 1);
    assert!(llm.calls()[0].last().unwrap().content.contains('B'));
    assert_eq!(started_nodes(&events).iter().filter(|n| *n == "end").count(), 1);
}

#[tokio::test]
async fn tool_timeout_aborts_before_downstream_starts() {
    let wf = workflow(json!({
        "id": "timeout",
        "nodes": [
            {"id": "start", "type": "start"},
            {"id": "tool", "type": "tool", "tool": "search"},
            {"id": "summarize", "type": "llm", "prompt": "sum"},
            {"id": "end", "type": "end"}
        ],
        "edges": [
            {"source": "start", "target": "tool"},
            {"source": "tool", "target": "summarize"},
            {"source": "summarize", "target": "end"}
        ]
    }));
    let llm = shared(ScriptedLlm::new(&["never"]));
    let tools = shared(ScriptedTools::new().with("search", ToolBehavior::TimeOut(5)));
    let engine = engine(llm.clone(), tools);
    let handle = engine.start(engine.compile(&wf).unwrap(), input(json!({})));
    let events = collect_events(handle.events()).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.status, RunStatus::Failed);
    let kind = events.iter().find_map(|e| match &e.kind {
        EventKind::NodeError { node_id, error } if node_id == "tool" => Some(error.kind),
        _ => None,
    });
    assert_eq!(kind, Some(NodeErrorKind::Timeout));
    assert_eq!(started_nodes(&events), vec!["start", "tool"]);
    assert_eq!(llm.call_count(), 0);
    assert_eq!(event_types(&events).last().unwrap(), "WORKFLOW_END(FAILED)");
}

#[tokio::test]
async fn merge_waits_for_both_branches_in_either_order() {
    for (fast, slow) in [("left", "right"), ("right", "left")] {
        let wf = workflow(json!({
            "id": "diamond",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "left", "type": "tool", "tool": "left"},
                {"id": "right", "type": "tool", "tool": "right"},
                {"id": "merge", "type": "tool", "tool": "merge"},
                {"id": "end", "type": "end", "usageFields": ["merge"]}
            ],
            "edges": [
                {"source": "start", "target": "left"},
                {"source": "start", "target": "right"},
                {"source": "left", "target": "merge"},
                {"source": "right", "target": "merge"},
                {"source": "merge", "target": "end"}
            ]
        }));
        let tools = shared(
            ScriptedTools::new()
                .with(fast, ToolBehavior::Delay(Duration::from_millis(10), json!(fast)))
                .with(slow, ToolBehavior::Delay(Duration::from_millis(120), json!(slow)))
                .with("merge", ToolBehavior::Return(json!("merged"))),
        );
        let engine = engine(shared(ScriptedLlm::new(&[])), tools.clone());
        let handle = engine.start(engine.compile(&wf).unwrap(), input(json!({})));
        let events = collect_events(handle.events()).await;
        let outcome = handle.wait().await;

        assert_well_formed(&events);
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.output, Some(json!({"merge": "merged"})));
        let merge_start = position(&events, "NODE_START", "merge").unwrap();
        assert!(position(&events, "NODE_END", fast).unwrap() < merge_start);
        assert!(position(&events, "NODE_END", slow).unwrap() < merge_start);
        let merge_calls = tools.calls().iter().filter(|(n, _)| n == "merge").count();
        assert_eq!(merge_calls, 1);
    }
}

#[tokio::test]
async fn cancelling_a_streaming_run() {
    let wf = workflow(json!({
        "id": "long",
        "nodes": [
            {"id": "start", "type": "start"},
            {"id": "essay", "type": "llm", "prompt": "write a lot"},
            {"id": "end", "type": "end"}
        ],
        "edges": [
            {"source": "start", "target": "essay"},
            {"source": "essay", "target": "end"}
        ]
    }));
    let engine = engine(shared(ScriptedLlm::hanging()), shared(ScriptedTools::new()));
    let handle = engine.start(engine.compile(&wf).unwrap(), input(json!({})));
    let rx = handle.events();

    while position(&handle.history(), "NODE_START", "essay").is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.cancel();
    handle.cancel();
    let events = collect_events(rx).await;
    let outcome = handle.wait().await;

    assert_well_formed(&events);
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert!(position(&events, "NODE_ERROR", "essay").is_some());
    assert!(position(&events, "NODE_START", "end").is_none());
}

#[tokio::test]
async fn compiled_graph_is_reusable_across_runs() {
    let wf = workflow(json!({
        "id": "reuse",
        "nodes": [
            {"id": "start", "type": "start"},
            {"id": "echo", "type": "tool", "tool": "echo", "arguments": {"text": "{{word}}"}},
            {"id": "end", "type": "end", "usageFields": ["echo"]}
        ],
        "edges": [
            {"source": "start", "target": "echo"},
            {"source": "echo", "target": "end"}
        ]
    }));
    let tools = shared(ScriptedTools::new().with("echo", ToolBehavior::Return(json!("ok"))));
    let engine = engine(shared(ScriptedLlm::new(&[])), tools.clone());

    let first = engine.compile(&wf).unwrap();
    let second = engine.compile(&wf).unwrap();
    assert_eq!(first.topo_order(), second.topo_order());

    let graph = Arc::new(first);
    let a = engine.start(graph.clone(), input(json!({"word": "one"})));
    let b = engine.start(graph, input(json!({"word": "two"})));
    let (a, b) = (a.wait().await, b.wait().await);

    assert_ne!(a.run_id, b.run_id);
    assert_eq!(a.status, RunStatus::Completed);
    assert_eq!(b.status, RunStatus::Completed);
    let mut texts: Vec<Value> = tools.calls().into_iter().map(|(_, input)| input["text"].clone()).collect();
    texts.sort_by_key(|v| v.to_string());
    assert_eq!(texts, vec![json!("one"), json!("two")]);
}

#[test]
fn cyclic_workflow_is_rejected_at_compile_time() {
    let wf = workflow(json!({
        "id": "loop",
        "nodes": [
            {"id": "start", "type": "start"},
            {"id": "a", "type": "tool", "tool": "a"},
            {"id": "b", "type": "tool", "tool": "b"}
        ],
        "edges": [
            {"source": "start", "target": "a"},
            {"source": "a", "target": "b"},
            {"source": "b", "target": "a"}
        ]
    }));
    let err = flowrun_engine::compile(&wf).unwrap_err();
    assert!(matches!(err, GraphError::CycleDetected(_)), "got {:?}", err);
    assert_eq!(err.code(), "cycle_detected");
}

#[test]
fn workflow_without_start_is_rejected() {
    let wf = workflow(json!({
        "id": "headless",
        "nodes": [{"id": "end", "type": "end"}],
        "edges": []
    }));
    assert_eq!(
        flowrun_engine::compile(&wf).unwrap_err(),
        GraphError::MissingOrMultipleStart { found: 0 }
    );
}
