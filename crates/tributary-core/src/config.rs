//! Scheduler configuration
//!
//! Values come from serde defaults, optionally a JSON file, and `TRIBUTARY_*`
//! environment variables, in that order of precedence.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::CoreError;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Attempts for action steps that do not set `maxAttempts`
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Pause between attempts of a failing action, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Interval between polls for an external input response, in milliseconds
    #[serde(default = "default_input_poll_interval_ms")]
    pub input_poll_interval_ms: u64,

    /// Rounds after which a run is aborted as an internal error
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_input_poll_interval_ms() -> u64 {
    1000
}

fn default_max_rounds() -> u32 {
    10_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            input_poll_interval_ms: default_input_poll_interval_ms(),
            max_rounds: default_max_rounds(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        config.apply_env(lookup);
        config
    }

    /// Load configuration from a JSON file, then apply environment overrides
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        Self::from_json_file_with(path.as_ref(), |key| env::var(key).ok())
    }

    fn from_json_file_with(
        path: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CoreError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&contents)
            .map_err(|e| CoreError::ConfigurationError(e.to_string()))?;
        config.apply_env(lookup);
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("TRIBUTARY_DEFAULT_MAX_ATTEMPTS") {
            match value.parse::<u32>() {
                Ok(attempts) if attempts > 0 => self.default_max_attempts = attempts,
                _ => warn!("Invalid TRIBUTARY_DEFAULT_MAX_ATTEMPTS value: {}", value),
            }
        }

        if let Some(value) = lookup("TRIBUTARY_RETRY_BACKOFF_MS") {
            if let Ok(backoff) = value.parse::<u64>() {
                self.retry_backoff_ms = backoff;
            } else {
                warn!("Invalid TRIBUTARY_RETRY_BACKOFF_MS value: {}", value);
            }
        }

        if let Some(value) = lookup("TRIBUTARY_INPUT_POLL_INTERVAL_MS") {
            match value.parse::<u64>() {
                Ok(interval) if interval > 0 => self.input_poll_interval_ms = interval,
                _ => warn!("Invalid TRIBUTARY_INPUT_POLL_INTERVAL_MS value: {}", value),
            }
        }

        if let Some(value) = lookup("TRIBUTARY_MAX_ROUNDS") {
            match value.parse::<u32>() {
                Ok(rounds) if rounds > 0 => self.max_rounds = rounds,
                _ => warn!("Invalid TRIBUTARY_MAX_ROUNDS value: {}", value),
            }
        }
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.default_max_attempts == 0 {
            return Err(CoreError::ConfigurationError(
                "default_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.input_poll_interval_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "input_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_rounds == 0 {
            return Err(CoreError::ConfigurationError(
                "max_rounds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff between attempts
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Poll interval for external input
    pub fn input_poll_interval(&self) -> Duration {
        Duration::from_millis(self.input_poll_interval_ms)
    }
}
