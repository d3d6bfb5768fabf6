//! Graph Validator: turns a `Workflow` into a `CompiledGraph` or a `GraphError`.
//!
//! Checks run in a fixed order and the first failure wins:
//! duplicate ids, dangling edges, the start node count, nodes without inbound
//! edges, cycles, reachability from start, then condition branching and
//! condition expressions.
//!
//! Information nodes that cannot be reached from start are standalone
//! documentation. They are kept out of the compiled adjacency, together with
//! any edge leaving them, and never run.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use flowrun_core::error::GraphError;
use flowrun_core::schema::{Node, NodeKind, NodeType, Workflow};
use tracing::debug;

use crate::expr::Expr;

/// An edge as the scheduler sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Condition branch label (`"true"` / `"false"`), if any.
    pub handle: Option<String>,
}

/// The validated, adjacency-indexed form of a workflow.
///
/// All maps are ordered, so compiling the same workflow twice yields equal
/// values.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledGraph {
    workflow_id: String,
    start: String,
    nodes: BTreeMap<String, Arc<Node>>,
    edges: Vec<CompiledEdge>,
    /// Node id -> indices into `edges`.
    outgoing: BTreeMap<String, Vec<usize>>,
    incoming: BTreeMap<String, Vec<usize>>,
    in_degree: BTreeMap<String, usize>,
    topo_order: Vec<String>,
    standalone: Vec<String>,
    conditions: BTreeMap<String, Expr>,
}

impl CompiledGraph {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Id of the unique start node.
    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    /// Executable nodes, keyed by id.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge(&self, index: usize) -> &CompiledEdge {
        &self.edges[index]
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Indices of edges leaving `id`.
    pub fn outgoing(&self, id: &str) -> &[usize] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Indices of edges entering `id`.
    pub fn incoming(&self, id: &str) -> &[usize] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Static inbound edge count, before any pruning.
    pub fn in_degree(&self, id: &str) -> usize {
        self.in_degree.get(id).copied().unwrap_or(0)
    }

    /// A topological order of executable nodes. A scheduling hint only.
    pub fn topo_order(&self) -> &[String] {
        &self.topo_order
    }

    /// Disconnected information nodes that are skipped at run time.
    pub fn standalone(&self) -> &[String] {
        &self.standalone
    }

    /// Parsed predicate of a condition node.
    pub fn condition(&self, id: &str) -> Option<&Expr> {
        self.conditions.get(id)
    }
}

/// Validate a workflow and build its `CompiledGraph`.
pub fn compile(workflow: &Workflow) -> Result<CompiledGraph, GraphError> {
    // (a) unique ids
    let mut by_id: BTreeMap<&str, &Node> = BTreeMap::new();
    for node in &workflow.nodes {
        if by_id.insert(node.id.as_str(), node).is_some() {
            return Err(GraphError::DuplicateNodeId(node.id.clone()));
        }
    }

    // (b) edge endpoints exist
    let mut edges = Vec::with_capacity(workflow.edges.len());
    for edge in &workflow.edges {
        let id = if edge.id.is_empty() {
            format!("{}->{}", edge.source, edge.target)
        } else {
            edge.id.clone()
        };
        for endpoint in [&edge.source, &edge.target] {
            if !by_id.contains_key(endpoint.as_str()) {
                return Err(GraphError::DanglingEdge {
                    edge_id: id,
                    node_id: endpoint.clone(),
                });
            }
        }
        edges.push(CompiledEdge {
            id,
            source: edge.source.clone(),
            target: edge.target.clone(),
            handle: edge.source_handle.clone(),
        });
    }

    // (c) exactly one start node
    let starts: Vec<&str> = by_id
        .values()
        .filter(|n| n.node_type() == NodeType::Start)
        .map(|n| n.id.as_str())
        .collect();
    if starts.len() != 1 {
        return Err(GraphError::MissingOrMultipleStart {
            found: starts.len(),
        });
    }
    let start = starts[0].to_string();

    // (d) every non-start node has an inbound edge, information nodes excepted
    let targets: HashSet<&str> = edges.iter().map(|e| e.target.as_str()).collect();
    for node in by_id.values() {
        let exempt = matches!(node.node_type(), NodeType::Start | NodeType::Information);
        if !exempt && !targets.contains(node.id.as_str()) {
            return Err(GraphError::OrphanNode(node.id.clone()));
        }
    }

    // (e) no cycles anywhere in the graph
    if let Some(node_id) = find_cycle(by_id.keys().copied(), &edges) {
        return Err(GraphError::CycleDetected(node_id));
    }

    // start must reach everything that is not standalone documentation
    let reachable = reachable_from(&start, &edges);
    let mut standalone = Vec::new();
    for node in by_id.values() {
        if reachable.contains(node.id.as_str()) {
            continue;
        }
        if node.node_type() == NodeType::Information {
            standalone.push(node.id.clone());
        } else {
            return Err(GraphError::OrphanNode(node.id.clone()));
        }
    }

    let edges: Vec<CompiledEdge> = edges
        .into_iter()
        .filter(|e| reachable.contains(e.source.as_str()))
        .collect();

    let mut outgoing: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let mut incoming: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, edge) in edges.iter().enumerate() {
        outgoing.entry(edge.source.clone()).or_default().push(idx);
        incoming.entry(edge.target.clone()).or_default().push(idx);
    }

    let nodes: BTreeMap<String, Arc<Node>> = by_id
        .iter()
        .filter(|(id, _)| reachable.contains(**id))
        .map(|(id, node)| (id.to_string(), Arc::new((*node).clone())))
        .collect();

    // (f) condition nodes branch exactly once on true and once on false
    let mut conditions = BTreeMap::new();
    for node in nodes.values() {
        let NodeKind::Condition(cfg) = &node.kind else {
            continue;
        };
        let out = outgoing.get(&node.id).map(Vec::as_slice).unwrap_or(&[]);
        check_branching(&node.id, out, &edges)?;
        let expr = Expr::parse(&cfg.expression).map_err(|e| GraphError::InvalidExpression {
            node_id: node.id.clone(),
            message: e.to_string(),
        })?;
        conditions.insert(node.id.clone(), expr);
    }

    let in_degree: BTreeMap<String, usize> = nodes
        .keys()
        .map(|id| (id.clone(), incoming.get(id).map_or(0, Vec::len)))
        .collect();
    let topo_order = topological_order(&in_degree, &outgoing, &edges);

    debug!(
        workflow_id = %workflow.id,
        nodes = nodes.len(),
        edges = edges.len(),
        standalone = standalone.len(),
        "Workflow compiled"
    );

    Ok(CompiledGraph {
        workflow_id: workflow.id.clone(),
        start,
        nodes,
        edges,
        outgoing,
        incoming,
        in_degree,
        topo_order,
        standalone,
        conditions,
    })
}

fn check_branching(node_id: &str, out: &[usize], edges: &[CompiledEdge]) -> Result<(), GraphError> {
    let invalid = |reason: String| GraphError::InvalidConditionBranching {
        node_id: node_id.to_string(),
        reason,
    };
    if out.len() != 2 {
        return Err(invalid(format!(
            "expected exactly 2 outgoing edges, found {}",
            out.len()
        )));
    }
    let handles: BTreeSet<&str> = out
        .iter()
        .filter_map(|&i| edges[i].handle.as_deref())
        .collect();
    if handles != BTreeSet::from(["false", "true"]) {
        return Err(invalid(
            "outgoing edges must be labelled \"true\" and \"false\"".to_string(),
        ));
    }
    Ok(())
}

fn reachable_from(start: &str, edges: &[CompiledEdge]) -> HashSet<String> {
    let mut seen = HashSet::from([start.to_string()]);
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
        for edge in edges.iter().filter(|e| e.source == current) {
            if seen.insert(edge.target.clone()) {
                queue.push_back(edge.target.as_str());
            }
        }
    }
    seen
}

/// Kahn's algorithm over the whole graph. Returns the lowest id lying on a
/// cycle, if any.
fn find_cycle<'a>(ids: impl Iterator<Item = &'a str>, edges: &'a [CompiledEdge]) -> Option<String> {
    let mut remaining: BTreeSet<&str> = ids.collect();

    // Peel sources, then sinks; what is left lies on or between cycles.
    loop {
        let before = remaining.len();
        let live = |e: &&CompiledEdge| {
            remaining.contains(e.source.as_str()) && remaining.contains(e.target.as_str())
        };
        let has_in: HashSet<&str> = edges.iter().filter(live).map(|e| e.target.as_str()).collect();
        let has_out: HashSet<&str> = edges.iter().filter(live).map(|e| e.source.as_str()).collect();
        remaining.retain(|id| has_in.contains(id) && has_out.contains(id));
        if remaining.len() == before {
            break;
        }
    }

    remaining.iter().next().map(|id| id.to_string())
}

fn topological_order(
    in_degree: &BTreeMap<String, usize>,
    outgoing: &BTreeMap<String, Vec<usize>>,
    edges: &[CompiledEdge],
) -> Vec<String> {
    let mut degree = in_degree.clone();
    let mut ready: BTreeSet<String> = degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut order = Vec::with_capacity(degree.len());

    while let Some(id) = ready.pop_first() {
        for &idx in outgoing.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
            let target = &edges[idx].target;
            if let Some(d) = degree.get_mut(target) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(target.clone());
                }
            }
        }
        order.push(id);
    }
    order
}
