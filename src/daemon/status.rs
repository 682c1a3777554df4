//! Daemon status snapshot, computed from the queue document.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::daemon::queue::QueueState;
use crate::daemon::TaskStatus;

/// How many recent completions feed the average.
const RECENT_COMPLETIONS: usize = 10;

/// What `ralph daemon status` prints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// A daemon has heartbeated within the staleness window.
    pub running: bool,
    pub paused: bool,
    pub stop_requested: bool,
    pub workers: usize,
    pub queued: usize,
    pub running_tasks: usize,
    pub done: usize,
    pub cancelled: usize,
    pub running_task_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Average run time of recent completions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_duration_secs: Option<u64>,
    /// Estimated time for the queued tasks to drain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_secs: Option<u64>,
}

impl DaemonStatus {
    pub fn from_state(state: &QueueState, workers: usize, stale_after: Duration) -> Self {
        let now = Utc::now();
        let running = state.daemon.as_ref().is_some_and(|d| {
            (now - d.last_heartbeat)
                .to_std()
                .map(|age| age <= stale_after)
                .unwrap_or(true)
        });

        let mut finished: Vec<_> = state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .filter_map(|t| t.finished_at.zip(t.run_secs()))
            .collect();
        finished.sort_by(|a, b| b.0.cmp(&a.0));
        let recent: Vec<i64> = finished
            .iter()
            .take(RECENT_COMPLETIONS)
            .map(|(_, secs)| *secs)
            .collect();
        let average_duration_secs = if recent.is_empty() {
            None
        } else {
            Some((recent.iter().sum::<i64>() / recent.len() as i64) as u64)
        };

        let queued = state.with_status(TaskStatus::Queued).len();
        let estimated_wait_secs = average_duration_secs.map(|avg| {
            let rounds = queued.div_ceil(workers.max(1)) as u64;
            avg * rounds
        });

        Self {
            running,
            paused: state.paused,
            stop_requested: state.stop_requested,
            workers,
            queued,
            running_tasks: state.with_status(TaskStatus::Running).len(),
            done: state.with_status(TaskStatus::Done).len(),
            cancelled: state.with_status(TaskStatus::Cancelled).len(),
            running_task_ids: state
                .with_status(TaskStatus::Running)
                .iter()
                .map(|t| t.id.clone())
                .collect(),
            daemon_id: state.daemon.as_ref().map(|d| d.id.clone()),
            last_heartbeat: state.daemon.as_ref().map(|d| d.last_heartbeat),
            average_duration_secs,
            estimated_wait_secs,
        }
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let state = match (self.running, self.paused) {
            (false, _) => "stopped",
            (true, true) => "paused",
            (true, false) => "running",
        };
        let mut line = format!(
            "daemon {}: {} queued, {} running, {} done, {} cancelled ({} workers)",
            state, self.queued, self.running_tasks, self.done, self.cancelled, self.workers
        );
        if let Some(wait) = self.estimated_wait_secs {
            line.push_str(&format!(", est. wait {}s", wait));
        }
        line
    }
}
