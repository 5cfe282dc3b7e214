//! Error Types
//!
//! Step-level failures, engine-level errors and store errors. A missing
//! input is not an error here: parameter resolution reports it through
//! [`Resolution::Missing`](super::resolver::Resolution::Missing) so the
//! engine can pause instead of failing.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::workflow::ExecutionStatus;

/// Which side of a step a schema guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Input,
    Output,
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// Error raised by a service executor.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutorError {
    /// Worth retrying (rate limits, dropped connections)
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl ExecutorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Why a single step did not produce a usable result.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    #[error("{kind} schema validation failed for step '{step_id}': {}", .messages.join("; "))]
    SchemaValidation {
        step_id: String,
        kind: SchemaKind,
        messages: Vec<String>,
    },

    #[error("step '{step_id}' timed out after {}s", .limit.as_secs_f64())]
    Timeout { step_id: String, limit: Duration },

    #[error("no executor registered for service '{0}'")]
    UnknownService(String),

    #[error("step '{step_id}' failed: {message}")]
    Execution { step_id: String, message: String },

    /// Primary and fallback both failed
    #[error("primary service '{primary}' failed: {primary_error}; fallback service '{fallback}' failed: {fallback_error}")]
    FallbackExhausted {
        primary: String,
        primary_error: String,
        fallback: String,
        fallback_error: String,
    },

    #[error("sub-workflow depth limit of {limit} exceeded")]
    RecursionLimit { limit: u32 },

    #[error("sub-workflow '{workflow_id}' ended {status}: {message}")]
    SubWorkflow {
        workflow_id: String,
        status: ExecutionStatus,
        message: String,
    },
}

impl StepError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Configuration errors fail the run even under `continue_on_error`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnknownService(_))
    }
}

/// Errors from a state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("execution '{0}' not found")]
    NotFound(String),

    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the engine's public entry points.
///
/// Ordinary step failures are not errors: they are reported through the
/// returned execution state.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("execution '{execution_id}' is {status}, only PAUSED executions can be resumed")]
    NotPaused {
        execution_id: String,
        status: ExecutionStatus,
    },

    #[error("step task aborted: {0}")]
    TaskAborted(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;
