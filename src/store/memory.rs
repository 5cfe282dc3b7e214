//! In-memory collaborators, used by tests and embedders that do not need
//! state to outlive the process.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{StateStore, WorkflowRepository};
use crate::execution::error::StoreError;
use crate::workflow::{ExecutionState, ExecutionStatus, PauseInfo, StepStatus, WorkflowDefinition};

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    executions: RwLock<HashMap<String, ExecutionState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of executions held.
    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.read().await.is_empty()
    }

    async fn modify(
        &self,
        execution_id: &str,
        f: impl FnOnce(&mut ExecutionState) + Send,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let state = executions
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;
        f(state);
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_execution(
        &self,
        workflow_id: &str,
        input_data: Map<String, Value>,
    ) -> Result<String, StoreError> {
        let execution_id = Uuid::new_v4().to_string();
        let state = ExecutionState::new(&execution_id, workflow_id, input_data);
        self.executions
            .write()
            .await
            .insert(execution_id.clone(), state);
        Ok(execution_id)
    }

    async fn get_execution_state(&self, execution_id: &str) -> Result<ExecutionState, StoreError> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))
    }

    async fn update_step_status(
        &self,
        execution_id: &str,
        step_id: &str,
        status: StepStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.modify(execution_id, |state| {
            state.apply_step_update(step_id, status, output, error)
        })
        .await
    }

    async fn update_execution_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.modify(execution_id, |state| state.apply_status(status, error))
            .await
    }

    async fn update_execution_inputs(
        &self,
        execution_id: &str,
        inputs: Map<String, Value>,
    ) -> Result<(), StoreError> {
        self.modify(execution_id, |state| state.merge_inputs(inputs))
            .await
    }

    async fn set_pause_info(
        &self,
        execution_id: &str,
        pause: Option<PauseInfo>,
    ) -> Result<(), StoreError> {
        self.modify(execution_id, |state| state.pause = pause).await
    }
}

/// Workflow definitions keyed by id.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_workflows(workflows: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        let map = workflows.into_iter().map(|w| (w.id.clone(), w)).collect();
        Self {
            workflows: RwLock::new(map),
        }
    }

    pub async fn insert(&self, workflow: WorkflowDefinition) {
        self.workflows
            .write()
            .await
            .insert(workflow.id.clone(), workflow);
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn get_workflow(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.workflows.read().await.get(workflow_id).cloned()
    }
}
