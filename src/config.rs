//! Engine Configuration
//!
//! Settings are read from an optional YAML (or JSON) file and may be
//! overridden from the environment:
//!
//! | Variable                    | Field                |
//! |-----------------------------|----------------------|
//! | `FLOWPILOT_MAX_CONCURRENCY` | `max_concurrency`    |
//! | `FLOWPILOT_RETRY_ATTEMPTS`  | `retry.max_attempts` |
//! | `FLOWPILOT_STATE_DIR`       | `state_dir`          |
//!
//! Command-line flags take precedence over both.

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Default cap on concurrently running graph steps.
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// Default sub-workflow nesting limit.
pub const DEFAULT_MAX_WORKFLOW_DEPTH: u32 = 3;

/// Retry policy for transient executor errors.
///
/// The delay before retry `n` (1-based) is `base_delay * 2^(n-1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given retry (1 is the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub max_workflow_depth: u32,
    pub state_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry: RetryPolicy::default(),
            max_workflow_depth: DEFAULT_MAX_WORKFLOW_DEPTH,
            state_dir: PathBuf::from(".flowpilot"),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a file; missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn Error>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?
        };

        debug!("Loaded config from {}: {:?}", path.display(), config);
        Ok(config.normalized())
    }

    /// Applies `FLOWPILOT_*` environment variables.
    pub fn apply_env_overrides(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self.normalized()
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = get("FLOWPILOT_MAX_CONCURRENCY") {
            match raw.trim().parse() {
                Ok(n) => self.max_concurrency = n,
                Err(_) => warn!("Ignoring FLOWPILOT_MAX_CONCURRENCY='{}': not a number", raw),
            }
        }
        if let Some(raw) = get("FLOWPILOT_RETRY_ATTEMPTS") {
            match raw.trim().parse() {
                Ok(n) => self.retry.max_attempts = n,
                Err(_) => warn!("Ignoring FLOWPILOT_RETRY_ATTEMPTS='{}': not a number", raw),
            }
        }
        if let Some(raw) = get("FLOWPILOT_STATE_DIR") {
            if !raw.trim().is_empty() {
                self.state_dir = PathBuf::from(raw.trim());
            }
        }
    }

    /// Clamps values that would stall the engine.
    pub fn normalized(mut self) -> Self {
        if self.max_concurrency == 0 {
            warn!("max_concurrency of 0 would stall every run; using 1");
            self.max_concurrency = 1;
        }
        if self.max_concurrency > Semaphore::MAX_PERMITS {
            warn!(
                "max_concurrency of {} is above the limit; using {}",
                self.max_concurrency,
                Semaphore::MAX_PERMITS
            );
            self.max_concurrency = Semaphore::MAX_PERMITS;
        }
        if self.retry.max_attempts == 0 {
            self.retry.max_attempts = 1;
        }
        self
    }
}
