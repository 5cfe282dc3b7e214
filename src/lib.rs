//! Flowpilot - Workflow Execution Engine
//!
//! Runs multi-step automations against external services. A workflow is a
//! set of nodes joined by connections; steps pass data to each other
//! through `${step.path}` references, conditional connections branch the
//! run, and a step waiting for data that is not there yet pauses the
//! whole execution until it is supplied.
//!
//! # Architecture
//!
//! The library is organized into five modules:
//!
//! - [`workflow`]: Definitions, execution state, loading and planning
//! - [`execution`]: The engine, dispatcher, resolver and evaluators
//! - [`store`]: State store, notifier, analytics and workflow repository
//! - [`monitoring`]: Execution timeline
//! - [`config`]: Engine configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use flowpilot::execution::{BuiltinExecutor, Engine, ExecutorRegistry};
//! use flowpilot::load_workflow;
//! use flowpilot::store::FileStateStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let workflow = load_workflow("onboarding.yaml")?;
//!
//!     // Register executors and pick a state store
//!     let registry = ExecutorRegistry::new().with("builtin", BuiltinExecutor);
//!     let mut engine = Engine::new(registry, Arc::new(FileStateStore::new(".flowpilot")));
//!     engine.set_max_concurrency(4);
//!
//!     // Execute the workflow
//!     let state = engine.run(&workflow, serde_json::Map::new()).await?;
//!     println!("{}", state.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod execution;
pub mod monitoring;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use execution::engine::Engine;
pub use workflow::model::{Connection, Node, Step, WorkflowDefinition};
pub use workflow::parser::load_workflow;
pub use workflow::state::{ExecutionState, ExecutionStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Flowpilot";
