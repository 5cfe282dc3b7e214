//! Log-backed notifier and analytics sink.

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;

use super::{AnalyticsSink, CollaboratorError, ExecutionEvent, Notifier, RunMetrics};

/// Writes status events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        user_id: Option<&str>,
        execution_id: &str,
        event: ExecutionEvent,
        payload: &Value,
    ) -> Result<(), CollaboratorError> {
        match event {
            ExecutionEvent::StepRunning | ExecutionEvent::StepCompleted | ExecutionEvent::StepSkipped => {
                debug!("[{}] {} {}", execution_id, event, payload)
            }
            _ => info!(
                "[{}] {} {} (user: {})",
                execution_id,
                event,
                payload,
                user_id.unwrap_or("-")
            ),
        }
        Ok(())
    }
}

/// Writes run metrics to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAnalytics;

#[async_trait]
impl AnalyticsSink for LogAnalytics {
    async fn track_workflow_execution(&self, metrics: &RunMetrics) -> Result<(), CollaboratorError> {
        info!(
            "Workflow '{}' {} in {:.2}s (time saved: {}s, value: {})",
            metrics.workflow_id,
            if metrics.success { "succeeded" } else { "did not succeed" },
            metrics.duration_seconds,
            metrics.time_saved_seconds,
            metrics.business_value
        );
        Ok(())
    }
}
