//! Runner configuration.

use crate::executor::LOCAL_EXECUTOR;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduling settings for a [`Runner`](crate::runner::Runner).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum number of nodes of one layer executing at once.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// How often job executors are polled, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Executor used when neither the node nor the workflow names one.
    #[serde(default = "default_executor")]
    pub default_executor: String,
}

fn default_max_workers() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_executor() -> String {
    LOCAL_EXECUTOR.to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            default_executor: default_executor(),
        }
    }
}

impl RunnerConfig {
    /// Job poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
