//! Scheduler configuration.

use horde_core::job::DEFAULT_MAX_INCOMPLETE_RETRIES;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How many times a step lost with its agent is re-run automatically.
    #[serde(default = "default_max_incomplete_retries")]
    pub max_incomplete_retries: u32,
    /// Task source tick interval in seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Attempts made by read-modify-write updates before giving up.
    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: u32,
}

fn default_max_incomplete_retries() -> u32 {
    DEFAULT_MAX_INCOMPLETE_RETRIES
}

fn default_tick_interval() -> u64 {
    5
}

fn default_max_update_attempts() -> u32 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_incomplete_retries: default_max_incomplete_retries(),
            tick_interval_secs: default_tick_interval(),
            max_update_attempts: default_max_update_attempts(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn with_max_incomplete_retries(mut self, retries: u32) -> Self {
        self.max_incomplete_retries = retries;
        self
    }

    pub fn with_max_update_attempts(mut self, attempts: u32) -> Self {
        self.max_update_attempts = attempts;
        self
    }
}
