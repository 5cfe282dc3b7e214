//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, loading,
//! validating and planning workflow runs.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (WorkflowDefinition, Node, Connection)
//! - [`state`]: Durable execution state (ExecutionState, StepState)
//! - [`parser`]: JSON/YAML loading
//! - [`validator`]: Validation rules and cycle checking
//! - [`graph`]: Linear plans and dependency graphs

pub mod graph;
pub mod model;
pub mod parser;
pub mod state;
pub mod validator;

pub use graph::{build_plan, ExecutionPlan, WorkflowGraph};
pub use model::{Connection, Node, NodeConfig, NodeType, Step, WorkflowDefinition};
pub use parser::load_workflow;
pub use state::{ExecutionState, ExecutionStatus, PauseInfo, StepState, StepStatus};
pub use validator::validate_workflow;
