//! File-backed State Store
//!
//! One pretty-printed JSON document per execution, named
//! `<execution_id>.json`, under the state directory. State survives the
//! process, so a run paused by one invocation can be resumed by the next.
//!
//! Every update is a read-modify-write of a single file; a store-wide
//! mutex serializes them so concurrently finishing steps cannot lose each
//! other's writes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::StateStore;
use crate::execution::error::StoreError;
use crate::workflow::{ExecutionState, ExecutionStatus, PauseInfo, StepStatus};

#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Uses `dir` for state files; it is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, execution_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", execution_id))
    }

    async fn read(&self, execution_id: &str) -> Result<ExecutionState, StoreError> {
        let path = self.path_for(execution_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(execution_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    async fn write(&self, state: &ExecutionState) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&state.execution_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(state)?).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Saved state for execution {} to {}", state.execution_id, path.display());
        Ok(())
    }

    async fn modify(
        &self,
        execution_id: &str,
        f: impl FnOnce(&mut ExecutionState) + Send,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.read(execution_id).await?;
        f(&mut state);
        self.write(&state).await
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn create_execution(
        &self,
        workflow_id: &str,
        input_data: Map<String, Value>,
    ) -> Result<String, StoreError> {
        let execution_id = Uuid::new_v4().to_string();
        let state = ExecutionState::new(&execution_id, workflow_id, input_data);
        let _guard = self.write_lock.lock().await;
        self.write(&state).await?;
        Ok(execution_id)
    }

    async fn get_execution_state(&self, execution_id: &str) -> Result<ExecutionState, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.read(execution_id).await
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
