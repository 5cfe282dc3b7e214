//! Execution Plan Builder
//!
//! Turns a workflow's nodes and connections into something the engine can
//! run:
//! - a linear, topologically ordered step list when no connection carries a
//!   condition
//! - a dependency graph (adjacency and reverse adjacency) otherwise, so
//!   branches and merges can be activated edge by edge
//!
//! Connections that reference unknown nodes are dropped.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, warn};

use super::model::{Connection, Node, Step, WorkflowDefinition};
use super::validator::ValidationError;

/// How a workflow will be executed.
#[derive(Debug, Clone)]
pub enum ExecutionPlan {
    /// Steps run strictly in order
    Linear(Vec<Step>),
    /// Steps run in rounds as their incoming connections activate
    Graph(WorkflowGraph),
}

impl ExecutionPlan {
    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Linear(_))
    }
}

/// Dependency graph of a workflow.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    /// Nodes by id
    pub nodes: HashMap<String, Node>,
    /// Node ids in declaration order
    pub order: Vec<String>,
    /// Outgoing connections per node
    pub adjacency: HashMap<String, Vec<Connection>>,
    /// Incoming connections per node
    pub reverse_adjacency: HashMap<String, Vec<Connection>>,
}

impl WorkflowGraph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn outgoing(&self, id: &str) -> &[Connection] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming(&self, id: &str) -> &[Connection] {
        self.reverse_adjacency
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Builds the execution plan for a workflow.
///
/// A precomputed `steps` list is used as-is in linear mode. Fails only
/// when the connections form a cycle.
pub fn build_plan(workflow: &WorkflowDefinition) -> Result<ExecutionPlan, ValidationError> {
    if workflow.has_conditional_connections() {
        let graph = build_graph(&workflow.nodes, &workflow.connections);
        // Kahn over the same edges detects cycles the rounds would never reach
        linearize(&workflow.nodes, &workflow.connections)?;
        debug!(
            "Workflow '{}' runs in graph mode ({} nodes)",
            workflow.id,
            graph.len()
        );
        return Ok(ExecutionPlan::Graph(graph));
    }

    if let Some(steps) = workflow.steps.as_ref().filter(|s| !s.is_empty()) {
        debug!("Workflow '{}' uses its precomputed step list", workflow.id);
        return Ok(ExecutionPlan::Linear(steps.clone()));
    }

    let steps = linearize(&workflow.nodes, &workflow.connections)?;
    debug!(
        "Topological order: {:?}",
        steps.iter().map(|s| &s.id).collect::<Vec<_>>()
    );
    Ok(ExecutionPlan::Linear(steps))
}

/// Returns connections whose endpoints both exist, warning about the rest.
fn known_connections<'a>(
    nodes: &[Node],
    connections: &'a [Connection],
) -> impl Iterator<Item = &'a Connection> {
    let ids: HashSet<String> = nodes.iter().map(|n| n.id.clone()).collect();
    connections.iter().filter(move |c| {
        let known = ids.contains(&c.source) && ids.contains(&c.target);
        if !known {
            warn!(
                "Dropping connection '{}': {} -> {} references an unknown node",
                c.id, c.source, c.target
            );
        }
        known
    })
}

/// Orders nodes with Kahn's algorithm.
///
/// Ties are broken by declaration order: the queue is seeded in node order
/// and successors are enqueued in connection order.
pub fn linearize(nodes: &[Node], connections: &[Connection]) -> Result<Vec<Step>, ValidationError> {
    let mut in_degree: HashMap<&str, usize> =
        nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

    for conn in known_connections(nodes, connections) {
        successors
            .entry(conn.source.as_str())
            .or_default()
            .push(conn.target.as_str());
        if let Some(degree) = in_degree.get_mut(conn.target.as_str()) {
            *degree += 1;
        }
    }

    // Start with root nodes (in-degree = 0)
    let mut queue: VecDeque<&str> = nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut sorted_order: Vec<&str> = Vec::with_capacity(nodes.len());

    while let Some(current) = queue.pop_front() {
        sorted_order.push(current);

        for successor in successors.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(successor) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*successor);
                }
            }
        }
    }

    if sorted_order.len() != nodes.len() {
        return Err(ValidationError::CyclicDependency);
    }

    let by_id: HashMap<&str, &Node> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    Ok(sorted_order
        .into_iter()
        .filter_map(|id| by_id.get(id).map(|n| (*n).clone()))
        .collect())
}

/// Builds adjacency and reverse adjacency maps.
pub fn build_graph(nodes: &[Node], connections: &[Connection]) -> WorkflowGraph {
    let mut graph = WorkflowGraph::default();

    for node in nodes {
        graph.order.push(node.id.clone());
        graph.nodes.insert(node.id.clone(), node.clone());
        graph.adjacency.entry(node.id.clone()).or_default();
        graph.reverse_adjacency.entry(node.id.clone()).or_default();
    }

    for conn in known_connections(nodes, connections) {
        graph
            .adjacency
            .entry(conn.source.clone())
            .or_default()
            .push(conn.clone());
        graph
            .reverse_adjacency
            .entry(conn.target.clone())
            .or_default()
            .push(conn.clone());
    }

    graph
}
