//! Worker coordinator: several iteration engines at once, one backlog and
//! one isolated workspace each.

pub mod coordinator;
pub mod registry;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

pub use coordinator::{CoordinatorSummary, WorkerCoordinator};
pub use registry::{WorkerOutcome, WorkerRegistration, WorkerRegistry, WorkerReport};

/// Configuration options for parallel backlog execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maximum number of workers alive at once.
    pub max_concurrency: usize,
    /// Interval of the liveness poll.
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// Git ref (or label) the isolated workspaces are derived from.
    pub source_ref: String,
    /// Delete a worker's workspace once it is deregistered.
    pub remove_workspaces: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            poll_interval: Duration::from_secs(2),
            source_ref: "HEAD".to_string(),
            remove_workspaces: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = source_ref.into();
        self
    }

    pub fn with_remove_workspaces(mut self, remove: bool) -> Self {
        self.remove_workspaces = remove;
        self
    }
}
