//! Execution State
//!
//! Durable record of one workflow run: overall status, per-step states,
//! recorded outputs and accumulated errors. Stores persist it between
//! runs so a paused execution can be resumed later, possibly by another
//! process.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Overall status of an execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    /// Suspended awaiting externally supplied input
    Paused,
    Completed,
    Failed,
    /// Finished with at least one step not completed
    Partial,
}

impl ExecutionStatus {
    /// Returns true for statuses that end a run for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Partial)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Partial => "PARTIAL",
        };
        f.write_str(name)
    }
}

/// Status of a single step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// Guard condition evaluated false (linear mode)
    Skipped,
    /// Waiting on missing input
    Paused,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Paused => "PAUSED",
        };
        f.write_str(name)
    }
}

/// Recorded state of one step.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StepState {
    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub updated_at: Option<DateTime<Utc>>,
}

/// Which step paused the run and the variable it was waiting for.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PauseInfo {
    pub step_id: String,
    pub missing_var: String,
}

/// Durable state of one workflow execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionState {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,

    #[serde(default)]
    pub input_data: Map<String, Value>,

    #[serde(default)]
    pub steps: HashMap<String, StepState>,

    /// Outputs of completed steps, keyed by step id
    #[serde(default)]
    pub outputs: HashMap<String, Value>,

    #[serde(default)]
    pub errors: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<PauseInfo>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    /// Creates a pending execution.
    pub fn new(
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        input_data: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            input_data,
            steps: HashMap::new(),
            outputs: HashMap::new(),
            errors: Vec::new(),
            pause: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns a step's status; unknown steps are pending.
    pub fn step_status(&self, step_id: &str) -> StepStatus {
        self.steps
            .get(step_id)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn is_step_completed(&self, step_id: &str) -> bool {
        self.step_status(step_id) == StepStatus::Completed
    }

    /// Returns ids of steps in the given status, sorted.
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<String> {
        let mut ids: Vec<String> = self
            .steps
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Applies a step status transition, recording output and error.
    ///
    /// An output is also written to the outputs map; an error is kept on
    /// the step and appended to the execution's error list.
    pub fn apply_step_update(
        &mut self,
        step_id: &str,
        status: StepStatus,
        output: Option<Value>,
        error: Option<String>,
    ) {
        let now = Utc::now();
        let entry = self.steps.entry(step_id.to_string()).or_default();
        entry.status = status;
        entry.updated_at = Some(now);

        if let Some(output) = output {
            self.outputs.insert(step_id.to_string(), output.clone());
            entry.output = Some(output);
        }

        match error {
            Some(message) => {
                self.errors.push(format!("{}: {}", step_id, message));
                entry.error = Some(message);
            }
            None if status != StepStatus::Failed => entry.error = None,
            None => {}
        }

        self.updated_at = now;
    }

    /// Sets the execution status, appending an error if given.
    pub fn apply_status(&mut self, status: ExecutionStatus, error: Option<String>) {
        self.status = status;
        if let Some(message) = error {
            self.errors.push(message);
        }
        if status != ExecutionStatus::Paused {
            self.pause = None;
        }
        self.updated_at = Utc::now();
    }

    /// Shallow-merges new keys into the input data.
    pub fn merge_inputs(&mut self, new_inputs: Map<String, Value>) {
        for (key, value) in new_inputs {
            self.input_data.insert(key, value);
        }
        self.updated_at = Utc::now();
    }
}
