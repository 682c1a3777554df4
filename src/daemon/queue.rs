//! Persisted task queue (`.ralph/daemon/queue.json`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::state_dir;
use crate::daemon::{TaskPriority, TaskStatus};
use crate::error::{RalphError, Result};
use crate::lock::{acquire_best_effort, lock_path_for, LockConfig};
use crate::persist::{read_json, write_json_atomic};

/// One backlog submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: String,
    pub backlog_path: PathBuf,
    pub priority: TaskPriority,
    pub submitted_at: DateTime<Utc>,
    pub status: TaskStatus,
    /// Submission order; FIFO tie-break within a priority tier.
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Cancel asked for while running; honoured between iterations.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Outcome label once done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl QueuedTask {
    /// Seconds between start and finish, when both are known.
    pub fn run_secs(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds().max(0)),
            _ => None,
        }
    }
}

/// The daemon process that owns the queue right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInstance {
    pub id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// What a cancel did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task had not started and will never run.
    Removed,
    /// The task is running; its engine stops at the next iteration boundary.
    Requested,
    /// The task had already finished.
    AlreadyFinished,
}

/// Whole queue document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueState {
    pub tasks: Vec<QueuedTask>,
    pub paused: bool,
    pub stop_requested: bool,
    pub next_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon: Option<DaemonInstance>,
}

impl QueueState {
    pub fn submit(&mut self, backlog_path: PathBuf, priority: TaskPriority) -> QueuedTask {
        self.next_seq += 1;
        let task = QueuedTask {
            id: format!("task-{}", self.next_seq),
            backlog_path,
            priority,
            submitted_at: Utc::now(),
            status: TaskStatus::Queued,
            seq: self.next_seq,
            started_at: None,
            finished_at: None,
            worker_id: None,
            cancel_requested: false,
            result: None,
            exit_code: None,
        };
        self.tasks.push(task.clone());
        task
    }

    pub fn task(&self, id: &str) -> Option<&QueuedTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut QueuedTask> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Highest-priority queued task, oldest first within a tier.
    pub fn next_runnable(&self) -> Option<&QueuedTask> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .min_by_key(|t| (t.priority, t.seq))
    }

    /// Mark the next runnable task running before its worker exists, so a
    /// concurrent cancel sees it as running rather than queued.
    pub fn claim_next(&mut self) -> Option<QueuedTask> {
        let id = self.next_runnable()?.id.clone();
        let task = self.task_mut(&id)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        Some(task.clone())
    }

    /// Queued tasks in the order they would run.
    pub fn pending(&self) -> Vec<&QueuedTask> {
        let mut pending: Vec<_> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .collect();
        pending.sort_by_key(|t| (t.priority, t.seq));
        pending
    }

    pub fn with_status(&self, status: TaskStatus) -> Vec<&QueuedTask> {
        self.tasks.iter().filter(|t| t.status == status).collect()
    }

    pub fn cancel(&mut self, id: &str) -> Result<CancelOutcome> {
        let task = self
            .task_mut(id)
            .ok_or_else(|| RalphError::UnknownTask(id.to_string()))?;
        Ok(match task.status {
            TaskStatus::Queued => {
                task.status = TaskStatus::Cancelled;
                task.finished_at = Some(Utc::now());
                CancelOutcome::Removed
            }
            TaskStatus::Running => {
                task.cancel_requested = true;
                CancelOutcome::Requested
            }
            TaskStatus::Done | TaskStatus::Cancelled => CancelOutcome::AlreadyFinished,
        })
    }

    pub fn mark_running(&mut self, id: &str, worker_id: &str) -> Result<()> {
        let task = self
            .task_mut(id)
            .ok_or_else(|| RalphError::UnknownTask(id.to_string()))?;
        task.status = TaskStatus::Running;
        task.worker_id = Some(worker_id.to_string());
        task.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_finished(
        &mut self,
        id: &str,
        status: TaskStatus,
        result: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let task = self
            .task_mut(id)
            .ok_or_else(|| RalphError::UnknownTask(id.to_string()))?;
        task.status = status;
        task.result = Some(result.into());
        task.exit_code = exit_code;
        task.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Put a running task back in the queue at its original priority.
    pub fn requeue(&mut self, id: &str) -> Result<()> {
        let task = self
            .task_mut(id)
            .ok_or_else(|| RalphError::UnknownTask(id.to_string()))?;
        task.status = TaskStatus::Queued;
        task.worker_id = None;
        task.started_at = None;
        Ok(())
    }

    /// Requeue every running task whose worker is not in `live_workers`.
    pub fn requeue_orphans(&mut self, live_workers: &HashSet<String>) -> Vec<String> {
        let orphans: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .filter(|t| {
                t.worker_id
                    .as_ref()
                    .map_or(true, |w| !live_workers.contains(w))
            })
            .map(|t| t.id.clone())
            .collect();
        for id in &orphans {
            if let Some(task) = self.task_mut(id) {
                task.status = TaskStatus::Queued;
                task.worker_id = None;
                task.started_at = None;
            }
        }
        orphans
    }
}

/// File-backed queue guarded by a best-effort lock.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    path: PathBuf,
    lock_config: LockConfig,
}

impl TaskQueue {
    pub fn new(root: &Path, lock_config: LockConfig) -> Self {
        Self {
            path: state_dir(root).join("daemon").join("queue.json"),
            lock_config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state; an absent file is an empty queue.
    pub fn load(&self) -> Result<QueueState> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    /// Read-modify-write under the queue lock.
    pub fn update<T, F>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut QueueState) -> Result<T>,
    {
        let _guard = acquire_best_effort(&lock_path_for(&self.path), &self.lock_config);
        let mut state = self.load()?;
        let value = mutate(&mut state)?;
        write_json_atomic(&self.path, &state)?;
        debug!(path = %self.path.display(), "queue written");
        Ok(value)
    }

    pub fn submit(&self, backlog_path: &Path, priority: TaskPriority) -> Result<QueuedTask> {
        let task = self.update(|state| Ok(state.submit(backlog_path.to_path_buf(), priority)))?;
        info!(task_id = %task.id, backlog = %backlog_path.display(), priority = %priority, "task submitted");
        Ok(task)
    }

    pub fn cancel(&self, id: &str) -> Result<CancelOutcome> {
        let outcome = self.update(|state| state.cancel(id))?;
        info!(task_id = id, outcome = ?outcome, "task cancel");
        Ok(outcome)
    }

    pub fn set_paused(&self, paused: bool) -> Result<()> {
        self.update(|state| {
            state.paused = paused;
            Ok(())
        })?;
        info!(paused, "queue pause flag set");
        Ok(())
    }

    pub fn request_stop(&self) -> Result<()> {
        self.update(|state| {
            state.stop_requested = true;
            Ok(())
        })
    }

    /// All tasks, submission order.
    pub fn tasks(&self) -> Result<Vec<QueuedTask>> {
        Ok(self.load()?.tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_strict_priority_then_fifo() {
        let mut state = QueueState::default();
        let low = state.submit("low.json".into(), TaskPriority::Low);
        let normal_a = state.submit("a.json".into(), TaskPriority::Normal);
        let high = state.submit("high.json".into(), TaskPriority::High);
        let normal_b = state.submit("b.json".into(), TaskPriority::Normal);

        let order: Vec<&str> = state.pending().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(
            order,
            vec![
                high.id.as_str(),
                normal_a.id.as_str(),
                normal_b.id.as_str(),
                low.id.as_str()
            ]
        );
        assert_eq!(state.next_runnable().map(|t| t.id.clone()), Some(high.id));
    }

    #[test]
    fn test_cancel_queued_and_running() {
        let mut state = QueueState::default();
        let queued = state.submit("a.json".into(), TaskPriority::Normal);
        let running = state.submit("b.json".into(), TaskPriority::Normal);
        state.mark_running(&running.id, "worker-1").expect("running");

        assert_eq!(state.cancel(&queued.id).expect("cancel"), CancelOutcome::Removed);
        assert_eq!(state.cancel(&running.id).expect("cancel"), CancelOutcome::Requested);
        assert_eq!(state.task(&queued.id).map(|t| t.status), Some(TaskStatus::Cancelled));
        assert!(state.task(&running.id).map(|t| t.cancel_requested).unwrap_or(false));
        assert!(state.next_runnable().is_none());
        assert!(matches!(state.cancel("task-99"), Err(RalphError::UnknownTask(_))));
    }

    #[test]
    fn test_requeue_orphans_keeps_priority() {
        let mut state = QueueState::default();
        let task = state.submit("a.json".into(), TaskPriority::High);
        state.mark_running(&task.id, "worker-7").expect("running");

        let orphans = state.requeue_orphans(&HashSet::new());

        assert_eq!(orphans, vec![task.id.clone()]);
        let requeued = state.task(&task.id).expect("task");
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert_eq!(requeued.priority, TaskPriority::High);
        assert!(requeued.worker_id.is_none());
    }

    #[test]
    fn test_live_worker_not_requeued() {
        let mut state = QueueState::default();
        let task = state.submit("a.json".into(), TaskPriority::Normal);
        state.mark_running(&task.id, "worker-1").expect("running");

        let live: HashSet<String> = ["worker-1".to_string()].into_iter().collect();
        assert!(state.requeue_orphans(&live).is_empty());
    }

    #[test]
    fn test_queue_file_round_trip() {
        let temp_dir = TempDir::new().expect("temp dir");
        let queue = TaskQueue::new(temp_dir.path(), LockConfig::default());

        assert!(queue.tasks().expect("empty").is_empty());
        let task = queue
            .submit(Path::new("prd.json"), TaskPriority::Low)
            .expect("submit");
        queue.set_paused(true).expect("pause");

        let state = queue.load().expect("load");
        assert!(state.paused);
        assert_eq!(state.tasks.len(), 1);
        assert_eq!(state.tasks[0].id, task.id);
        assert!(queue.path().ends_with(".ralph/daemon/queue.json"));
    }
}
