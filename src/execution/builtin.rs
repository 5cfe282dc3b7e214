//! Built-in Executor
//!
//! A small executor registered under the `builtin` service so workflows
//! can be run without any third-party integration.
//!
//! | Action  | Behavior                                          |
//! |---------|---------------------------------------------------|
//! | `echo`  | returns its parameters                            |
//! | `fail`  | permanent error with the `message` parameter      |
//! | `sleep` | waits `seconds`, then returns its parameters      |

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::{Map, Value};

use super::dispatcher::StepExecutor;
use super::error::ExecutorError;

/// Service name the built-in executor is registered under.
pub const BUILTIN_SERVICE: &str = "builtin";

#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinExecutor;

#[async_trait]
impl StepExecutor for BuiltinExecutor {
    async fn execute(&self, action: &str, params: &Map<String, Value>) -> Result<Value, ExecutorError> {
        match action {
            "echo" => Ok(Value::Object(params.clone())),
            "fail" => {
                let message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("step failed on request");
                Err(ExecutorError::permanent(message))
            }
            "sleep" => {
                let seconds = params.get("seconds").and_then(Value::as_f64).unwrap_or(0.0);
                let duration = Duration::try_from_secs_f64(seconds).map_err(|_| {
                    ExecutorError::permanent(format!("invalid sleep duration: {}", seconds))
                })?;
                debug!("builtin.sleep for {}s", seconds);
                tokio::time::sleep(duration).await;
                Ok(Value::Object(params.clone()))
            }
            other => Err(ExecutorError::permanent(format!(
                "unknown builtin action '{}'",
                other
            ))),
        }
    }
}
