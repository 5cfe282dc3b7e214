//! Workflow Execution Module
//!
//! Provides the execution engine for running workflow steps, including
//! reference resolution, conditional branching, service dispatch with
//! retries and fallbacks, and pause/resume.
//!
//! # Architecture
//!
//! - [`engine`]: Coordinator driving linear and graph runs
//! - [`dispatcher`]: Executor registry, retries, timeouts and fallbacks
//! - [`resolver`]: `${path}` references in step parameters
//! - [`condition`]: Boolean expressions on connections and steps
//! - [`schema`]: Input/output checks against JSON-Schema subsets
//! - [`builtin`]: The `builtin` service (echo, fail, sleep)
//! - [`error`]: Error types

pub mod builtin;
pub mod condition;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod resolver;
pub mod schema;

pub use builtin::{BuiltinExecutor, BUILTIN_SERVICE};
pub use condition::{evaluate_condition, Condition, ConditionError};
pub use dispatcher::{DispatchResult, Dispatcher, ExecutorRegistry, FnExecutor, StepExecutor};
pub use engine::{Engine, WORKFLOW_SERVICE};
pub use error::{EngineError, EngineResult, ExecutorError, StepError, StoreError};
pub use resolver::{resolve_parameters, Resolution};
