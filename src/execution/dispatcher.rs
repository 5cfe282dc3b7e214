//! Step Dispatch
//!
//! Maps a step's service to a registered executor and calls it with the
//! resolved parameters. Three policies are layered around the call:
//!
//! 1. transient executor errors are retried with doubling backoff
//! 2. the retried call is bounded by the step's timeout, if any
//! 3. a failed primary call is repeated against the fallback service
//!
//! Executors are injected through an [`ExecutorRegistry`] built by the
//! caller, so tests can register fakes per case.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use tokio::time;

use super::error::{ExecutorError, StepError};
use crate::config::RetryPolicy;
use crate::workflow::Step;

/// An integration that can run actions for one service.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, action: &str, params: &Map<String, Value>) -> Result<Value, ExecutorError>;
}

type BoxedCall = Pin<Box<dyn Future<Output = Result<Value, ExecutorError>> + Send>>;

/// Adapts an async closure into a [`StepExecutor`].
///
/// ```rust
/// use flowpilot::execution::FnExecutor;
/// use serde_json::json;
///
/// let executor = FnExecutor::new(|action, params| async move {
///     Ok(json!({"action": action, "count": params.len()}))
/// });
/// ```
pub struct FnExecutor {
    call: Box<dyn Fn(String, Map<String, Value>) -> BoxedCall + Send + Sync>,
}

impl FnExecutor {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ExecutorError>> + Send + 'static,
    {
        Self {
            call: Box::new(move |action, params| Box::pin(f(action, params))),
        }
    }
}

#[async_trait]
impl StepExecutor for FnExecutor {
    async fn execute(&self, action: &str, params: &Map<String, Value>) -> Result<Value, ExecutorError> {
        (self.call)(action.to_string(), params.clone()).await
    }
}

/// Executors keyed by service name.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor, replacing any previous one for the service.
    pub fn register(&mut self, service: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        let service = service.into();
        if self.executors.insert(service.clone(), executor).is_some() {
            warn!("Replaced executor for service '{}'", service);
        }
    }

    pub fn with(mut self, service: impl Into<String>, executor: impl StepExecutor + 'static) -> Self {
        self.register(service, Arc::new(executor));
        self
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(service).cloned()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.executors.contains_key(service)
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("services", &self.services())
            .finish()
    }
}

/// A successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    pub output: Value,
    pub service_used: String,
    pub fallback_used: bool,
    /// The primary failure when the fallback produced the output
    pub primary_error: Option<String>,
}

/// Adds audit fields to an output produced by a fallback service.
pub fn tag_fallback_output(output: Value, fallback: &str, original_error: &str) -> Value {
    let mut map = match output {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    };
    map.insert("fallback_used".to_string(), Value::Bool(true));
    map.insert("fallback_service".to_string(), Value::String(fallback.to_string()));
    map.insert("original_error".to_string(), Value::String(original_error.to_string()));
    Value::Object(map)
}

/// Calls registered executors on behalf of steps.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: ExecutorRegistry,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(registry: ExecutorRegistry) -> Self {
        Self {
            registry,
            retry: RetryPolicy::default(),
        }
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Runs one call, retrying transient errors.
    async fn call_with_retry(
        &self,
        executor: &dyn StepExecutor,
        service: &str,
        step: &Step,
        params: &Map<String, Value>,
    ) -> Result<Value, ExecutorError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match executor.execute(step.action_name(), params).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Retrying step '{}' on '{}' (attempt {}/{}) in {:?}, error: {}",
                        step.id,
                        service,
                        attempt + 1,
                        max_attempts,
                        delay,
                        e
                    );
                    time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One service call under the step's timeout.
    async fn call_service(
        &self,
        service: &str,
        executor: &dyn StepExecutor,
        step: &Step,
        params: &Map<String, Value>,
    ) -> Result<Value, StepError> {
        let call = self.call_with_retry(executor, service, step, params);

        let result = match step.timeout() {
            Some(limit) => {
                match time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(StepError::Timeout {
                            step_id: step.id.clone(),
                            limit,
                        })
                    }
                }
            }
            None => call.await,
        };

        result.map_err(|e| StepError::Execution {
            step_id: step.id.clone(),
            message: e.to_string(),
        })
    }

    /// Executes a step against its service, falling back on failure.
    pub async fn execute(&self, step: &Step, params: &Map<String, Value>) -> Result<DispatchResult, StepError> {
        let service = step.service().unwrap_or_default();
        let executor = self
            .registry
            .get(service)
            .ok_or_else(|| StepError::UnknownService(service.to_string()))?;

        debug!("Dispatching step '{}' to {}.{}", step.id, service, step.action_name());

        let primary_error = match self.call_service(service, executor.as_ref(), step, params).await {
            Ok(output) => {
                return Ok(DispatchResult {
                    output,
                    service_used: service.to_string(),
                    fallback_used: false,
                    primary_error: None,
                })
            }
            Err(e) => e,
        };

        let fallback = step.config.fallback_service.as_deref().filter(|f| !f.trim().is_empty());
        let Some((fallback, fallback_executor)) =
            fallback.and_then(|name| self.registry.get(name).map(|ex| (name, ex)))
        else {
            if let Some(name) = fallback {
                warn!(
                    "Step '{}': fallback service '{}' is not registered",
                    step.id, name
                );
            }
            return Err(primary_error);
        };

        info!(
            "Step '{}': primary service '{}' failed ({}); trying fallback '{}'",
            step.id, service, primary_error, fallback
        );

        match self
            .call_service(fallback, fallback_executor.as_ref(), step, params)
            .await
        {
            Ok(output) => {
                let original = primary_error.to_string();
                Ok(DispatchResult {
                    output: tag_fallback_output(output, fallback, &original),
                    service_used: fallback.to_string(),
                    fallback_used: true,
                    primary_error: Some(original),
                })
            }
            Err(fallback_error) => Err(StepError::FallbackExhausted {
                primary: service.to_string(),
                primary_error: primary_error.to_string(),
                fallback: fallback.to_string(),
                fallback_error: fallback_error.to_string(),
            }),
        }
    }
}
