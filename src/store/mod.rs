//! External Collaborators
//!
//! Narrow contracts the engine consumes, plus the implementations shipped
//! with the crate.
//!
//! # Structure
//!
//! - [`StateStore`]: durable execution state ([`InMemoryStateStore`], [`FileStateStore`])
//! - [`Notifier`]: fire-and-forget status events ([`LogNotifier`])
//! - [`AnalyticsSink`]: one record per finished run ([`LogAnalytics`])
//! - [`WorkflowRepository`]: definitions for nested runs ([`InMemoryWorkflowRepository`])
//!
//! Every store applies updates through the same [`ExecutionState`]
//! methods, so outputs, error lists and input merging behave identically
//! whichever backend is used.

pub mod file;
pub mod log_sink;
pub mod memory;

use std::error::Error;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::execution::error::StoreError;
use crate::workflow::{ExecutionState, ExecutionStatus, PauseInfo, StepStatus, WorkflowDefinition};

pub use self::file::FileStateStore;
pub use self::log_sink::{LogAnalytics, LogNotifier};
pub use self::memory::{InMemoryStateStore, InMemoryWorkflowRepository};

/// Error type for collaborators whose failures are logged and ignored.
pub type CollaboratorError = Box<dyn Error + Send + Sync>;

/// Durable execution state.
///
/// Implementations must give read-after-write consistency for a single
/// execution id.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Creates a PENDING execution and returns its id.
    async fn create_execution(
        &self,
        workflow_id: &str,
        input_data: Map<String, Value>,
    ) -> Result<String, StoreError>;

    async fn get_execution_state(&self, execution_id: &str) -> Result<ExecutionState, StoreError>;

    async fn update_step_status(
        &self,
        execution_id: &str,
        step_id: &str,
        status: StepStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    async fn update_execution_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Shallow-merges new keys into the stored input data.
    async fn update_execution_inputs(
        &self,
        execution_id: &str,
        inputs: Map<String, Value>,
    ) -> Result<(), StoreError>;

    /// Records (or clears) which step and variable paused the run.
    async fn set_pause_info(
        &self,
        execution_id: &str,
        pause: Option<PauseInfo>,
    ) -> Result<(), StoreError>;
}

/// Status events pushed to the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionEvent {
    Running,
    StepRunning,
    StepCompleted,
    StepSkipped,
    StepFailed,
    Paused,
    Failed,
    Completed,
    Partial,
}

impl ExecutionEvent {
    /// Event announcing a terminal or paused execution status.
    pub fn for_status(status: ExecutionStatus) -> Option<Self> {
        match status {
            ExecutionStatus::Running => Some(Self::Running),
            ExecutionStatus::Paused => Some(Self::Paused),
            ExecutionStatus::Failed => Some(Self::Failed),
            ExecutionStatus::Completed => Some(Self::Completed),
            ExecutionStatus::Partial => Some(Self::Partial),
            ExecutionStatus::Pending => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::StepRunning => "STEP_RUNNING",
            Self::StepCompleted => "STEP_COMPLETED",
            Self::StepSkipped => "STEP_SKIPPED",
            Self::StepFailed => "STEP_FAILED",
            Self::Paused => "PAUSED",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
            Self::Partial => "PARTIAL",
        }
    }
}

impl fmt::Display for ExecutionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Real-time status channel. Failures never abort a run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_id: Option<&str>,
        execution_id: &str,
        event: ExecutionEvent,
        payload: &Value,
    ) -> Result<(), CollaboratorError>;
}

/// What the analytics sink receives once per finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetrics {
    pub workflow_id: String,
    pub success: bool,
    pub duration_seconds: f64,
    pub time_saved_seconds: f64,
    pub business_value: f64,
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn track_workflow_execution(&self, metrics: &RunMetrics) -> Result<(), CollaboratorError>;
}

/// Source of workflow definitions for nested runs.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn get_workflow(&self, workflow_id: &str) -> Option<WorkflowDefinition>;
}
