//! Workflow Validation
//!
//! Checks a workflow definition before it is run:
//! - node field validation
//! - unique, non-empty node ids
//! - dependency graph validation (no cycles)
//!
//! Connections to unknown nodes and malformed condition expressions are
//! only warned about; the engine drops the former and evaluates the latter
//! to false.

use std::collections::HashSet;

use log::{debug, info, warn};

use super::graph::linearize;
use super::model::{Node, NodeType, WorkflowDefinition};
use crate::execution::condition::Condition;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow,
    DuplicateNodeId(String),
    EmptyNodeId,
    MissingService(String),
    MissingAction(String),
    CyclicDependency,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no nodes"),
            Self::DuplicateNodeId(id) => write!(f, "Duplicate node ID: '{}'", id),
            Self::EmptyNodeId => write!(f, "Node has empty or whitespace-only ID"),
            Self::MissingService(node) => {
                write!(f, "Action node '{}' has no service specified", node)
            }
            Self::MissingAction(node) => {
                write!(f, "Action node '{}' has no action specified", node)
            }
            Self::CyclicDependency => {
                write!(f, "Workflow contains cyclic connections (nodes depend on each other in a loop)")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validates a single node's fields.
fn validate_node(node: &Node) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if node.id.trim().is_empty() {
        errors.push(ValidationError::EmptyNodeId);
        return errors;
    }

    if node.node_type == NodeType::Action {
        if node.service().is_none() {
            errors.push(ValidationError::MissingService(node.id.clone()));
        }
        if node.action_name().is_empty() {
            errors.push(ValidationError::MissingAction(node.id.clone()));
        }
    }

    if let Some(condition) = node.config.condition.as_deref() {
        if let Err(e) = Condition::parse(condition) {
            warn!(
                "Node '{}': condition '{}' does not parse ({}); it will evaluate to false",
                node.id, condition, e
            );
        }
    }

    if let Some(fallback) = node.config.fallback_service.as_deref() {
        if node.service() == Some(fallback) {
            warn!(
                "Node '{}': fallback service '{}' is the same as the primary",
                node.id, fallback
            );
        }
    }

    errors
}

/// Validates the entire workflow structure.
///
/// Performs the following checks:
/// 1. Workflow is not empty
/// 2. No duplicate node IDs
/// 3. All nodes have valid fields
/// 4. No cyclic connections
pub fn validate_workflow(workflow: &WorkflowDefinition) -> Result<(), String> {
    info!(
        "Validating workflow '{}' with {} nodes",
        workflow.id,
        workflow.nodes.len()
    );

    if workflow.nodes.is_empty() {
        return Err(ValidationError::EmptyWorkflow.to_string());
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for node in &workflow.nodes {
        if !seen_ids.insert(node.id.as_str()) {
            return Err(ValidationError::DuplicateNodeId(node.id.clone()).to_string());
        }
    }

    let mut all_errors: Vec<ValidationError> = workflow
        .nodes
        .iter()
        .flat_map(validate_node)
        .collect();

    for conn in &workflow.connections {
        if !seen_ids.contains(conn.source.as_str()) || !seen_ids.contains(conn.target.as_str()) {
            warn!(
                "Connection '{}' ({} -> {}) references an unknown node and will be ignored",
                conn.id, conn.source, conn.target
            );
        }
        if let Some(condition) = conn.condition() {
            if let Err(e) = Condition::parse(condition) {
                warn!(
                    "Connection '{}': condition '{}' does not parse ({}); it will never activate",
                    conn.id, condition, e
                );
            }
        }
    }

    if let Err(e) = linearize(&workflow.nodes, &workflow.connections) {
        all_errors.push(e);
    }

    if !all_errors.is_empty() {
        let error_messages: Vec<String> = all_errors.iter().map(|e| e.to_string()).collect();
        return Err(error_messages.join("\n"));
    }

    debug!(
        "Workflow '{}' validated: services {:?}",
        workflow.id,
        workflow.services()
    );
    Ok(())
}
