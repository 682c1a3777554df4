//! The daemon loop: reap finished workers, honour control flags, launch
//! queued tasks into free slots, heartbeat.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backlog::BacklogStore;
use crate::config::RalphConfig;
use crate::daemon::queue::{CancelOutcome, DaemonInstance, QueueState, QueuedTask, TaskQueue};
use crate::daemon::status::DaemonStatus;
use crate::daemon::{DaemonConfig, TaskPriority, TaskStatus};
use crate::engine::{Collaborators, RunOutcome};
use crate::error::{RalphError, Result};
use crate::exit_codes;
use crate::lock::LockConfig;
use crate::parallel::{WorkerCoordinator, WorkerOutcome, WorkerReport};
use crate::persist::absolute_path;

/// Long-running queue processor backed by a [`WorkerCoordinator`].
pub struct TaskQueueDaemon {
    config: DaemonConfig,
    lock: LockConfig,
    queue: TaskQueue,
    coordinator: WorkerCoordinator,
    instance_id: String,
    /// worker id -> task id
    assignments: HashMap<String, String>,
}

impl TaskQueueDaemon {
    pub fn new(root: &Path, ralph: &RalphConfig, collaborators: Collaborators) -> Self {
        let coordinator_config = ralph
            .coordinator
            .clone()
            .with_max_concurrency(ralph.daemon.workers.max(1));
        let coordinator =
            WorkerCoordinator::new(root, ralph, collaborators).with_config(coordinator_config);
        Self {
            config: ralph.daemon.clone(),
            lock: ralph.lock.clone(),
            queue: TaskQueue::new(root, ralph.lock.clone()),
            coordinator,
            instance_id: format!(
                "daemon-{}-{}",
                std::process::id(),
                Utc::now().format("%Y%m%d%H%M%S")
            ),
            assignments: HashMap::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn task_queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Queue a backlog. The file is validated up front so a broken
    /// submission fails at the CLI rather than inside a worker.
    pub fn submit(&self, backlog_path: &Path, priority: TaskPriority) -> Result<QueuedTask> {
        let backlog_path = absolute_path(backlog_path)?;
        BacklogStore::new(&backlog_path, self.lock.clone()).load_validated()?;
        self.queue.submit(&backlog_path, priority)
    }

    /// Every task, submission order.
    pub fn queue(&self) -> Result<Vec<QueuedTask>> {
        self.queue.tasks()
    }

    /// Cancel a task. A running task is signalled right away when this
    /// daemon owns its worker; otherwise the owning daemon picks the flag up
    /// on its next poll.
    pub async fn cancel(&self, task_id: &str) -> Result<CancelOutcome> {
        let outcome = self.queue.cancel(task_id)?;
        if outcome == CancelOutcome::Requested {
            let worker = self
                .assignments
                .iter()
                .find(|(_, task)| task.as_str() == task_id)
                .map(|(worker, _)| worker.clone());
            if let Some(worker_id) = worker {
                if let Err(err) = self.coordinator.cancel_worker(&worker_id).await {
                    debug!(worker_id = %worker_id, error = %err, "worker already gone");
                }
            }
        }
        Ok(outcome)
    }

    pub fn pause(&self) -> Result<()> {
        self.queue.set_paused(true)
    }

    pub fn resume(&self) -> Result<()> {
        self.queue.set_paused(false)
    }

    pub fn status(&self) -> Result<DaemonStatus> {
        let state = self.queue.load()?;
        Ok(DaemonStatus::from_state(
            &state,
            self.config.workers,
            self.config.stale_after,
        ))
    }

    /// Claim the queue for this instance and requeue tasks left running by
    /// a previous daemon. Returns the requeued task ids.
    ///
    /// Fails with [`RalphError::DaemonAlreadyRunning`] while another
    /// instance is heartbeating.
    pub async fn start(&mut self) -> Result<Vec<String>> {
        let live: HashSet<String> = self
            .coordinator
            .active()
            .await
            .into_iter()
            .map(|w| w.worker_id)
            .collect();
        let instance_id = self.instance_id.clone();
        let stale_after = self.config.stale_after;

        let requeued = self.queue.update(|state| {
            let now = Utc::now();
            if let Some(other) = &state.daemon {
                let fresh = (now - other.last_heartbeat)
                    .to_std()
                    .map(|age| age <= stale_after)
                    .unwrap_or(true);
                if other.id != instance_id && fresh {
                    return Err(RalphError::DaemonAlreadyRunning {
                        instance: other.id.clone(),
                        pid: other.pid,
                    });
                }
            }
            state.daemon = Some(DaemonInstance {
                id: instance_id.clone(),
                pid: std::process::id(),
                started_at: now,
                last_heartbeat: now,
            });
            state.stop_requested = false;
            Ok(state.requeue_orphans(&live))
        })?;

        for task_id in &requeued {
            warn!(task_id = %task_id, "requeued task left running by a previous daemon");
        }
        info!(
            instance = %self.instance_id,
            workers = self.config.workers,
            requeued = requeued.len(),
            "daemon started"
        );
        Ok(requeued)
    }

    /// One poll: reap, propagate cancels, launch, heartbeat. Returns the
    /// queue state as of the end of the tick.
    pub async fn tick(&mut self) -> Result<QueueState> {
        let state = self.reap().await?;

        for task in state.with_status(TaskStatus::Running) {
            if !task.cancel_requested {
                continue;
            }
            if let Some(worker_id) = task.worker_id.as_deref() {
                if self.assignments.contains_key(worker_id) {
                    if let Err(err) = self.coordinator.cancel_worker(worker_id).await {
                        debug!(worker_id, error = %err, "cancel for departed worker");
                    }
                }
            }
        }

        if !state.paused && !state.stop_requested {
            self.launch_ready().await?;
        }
        self.queue.load()
    }

    /// Fold worker reports into the queue and refresh the heartbeat.
    async fn reap(&mut self) -> Result<QueueState> {
        self.coordinator.poll_liveness().await;
        let finished = self.coordinator.take_finished().await;
        let mut reaped: Vec<(String, WorkerReport)> = Vec::new();
        for report in finished {
            match self.assignments.remove(report.worker_id()) {
                Some(task_id) => reaped.push((task_id, report)),
                None => debug!(worker_id = report.worker_id(), "report for unassigned worker"),
            }
        }

        let instance_id = self.instance_id.clone();
        self.queue.update(|state| {
            for (task_id, report) in &reaped {
                apply_report(state, task_id, report)?;
            }
            if let Some(daemon) = state.daemon.as_mut() {
                if daemon.id == instance_id {
                    daemon.last_heartbeat = Utc::now();
                }
            }
            Ok(state.clone())
        })
    }

    async fn launch_ready(&mut self) -> Result<()> {
        while self.coordinator.can_start().await {
            let Some(task) = self.queue.update(|state| Ok(state.claim_next()))? else {
                break;
            };
            match self.coordinator.launch(&task.backlog_path).await {
                Ok(worker_id) => {
                    self.queue
                        .update(|state| state.mark_running(&task.id, &worker_id))?;
                    info!(
                        task_id = %task.id,
                        worker_id = %worker_id,
                        priority = %task.priority,
                        "task started"
                    );
                    self.assignments.insert(worker_id, task.id.clone());
                }
                Err(RalphError::CoordinatorFull(_)) => {
                    self.queue.update(|state| state.requeue(&task.id))?;
                    break;
                }
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "task failed to launch");
                    self.queue.update(|state| {
                        state.mark_finished(
                            &task.id,
                            TaskStatus::Done,
                            format!("failed: {}", err),
                            Some(exit_codes::FAILURE),
                        )
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Poll until `shutdown` fires or a stop is requested through the queue
    /// file, then cancel running workers, wait for them, requeue what they
    /// left unfinished and release the queue.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.start().await?;
        let poll_interval = self.config.poll_interval;
        let mut stopping = false;

        loop {
            let state = self.tick().await?;
            if !stopping && (state.stop_requested || *shutdown.borrow()) {
                info!(
                    active = self.coordinator.active_count().await,
                    "daemon stopping"
                );
                self.coordinator.cancel_all().await;
                stopping = true;
            }
            if stopping && self.coordinator.active_count().await == 0 {
                break;
            }
            wait_for(poll_interval, &mut shutdown).await;
        }

        self.reap().await?;
        let live = HashSet::new();
        let instance_id = self.instance_id.clone();
        let requeued = self.queue.update(|state| {
            let requeued = state.requeue_orphans(&live);
            if state.daemon.as_ref().is_some_and(|d| d.id == instance_id) {
                state.daemon = None;
            }
            state.stop_requested = false;
            Ok(requeued)
        })?;
        info!(requeued = requeued.len(), "daemon stopped");
        Ok(())
    }
}

async fn wait_for(interval: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        changed = shutdown.changed() => {
            // Sender gone: fall back to plain polling
            if changed.is_err() {
                tokio::time::sleep(interval).await;
            }
        }
    }
}

fn apply_report(state: &mut QueueState, task_id: &str, report: &WorkerReport) -> Result<()> {
    let cancel_requested = state.task(task_id).is_some_and(|t| t.cancel_requested);
    match &report.outcome {
        WorkerOutcome::Finished {
            outcome: RunOutcome::Cancelled,
        } if cancel_requested => state.mark_finished(
            task_id,
            TaskStatus::Cancelled,
            "cancelled",
            Some(exit_codes::PARTIAL),
        ),
        // Stopped by daemon shutdown: run it again next time
        WorkerOutcome::Finished {
            outcome: RunOutcome::Cancelled,
        } => state.requeue(task_id),
        WorkerOutcome::Finished { outcome } => {
            info!(task_id, outcome = %outcome, "task finished");
            state.mark_finished(
                task_id,
                TaskStatus::Done,
                outcome.to_string(),
                Some(outcome.exit_code()),
            )
        }
        WorkerOutcome::Failed { error } => state.mark_finished(
            task_id,
            TaskStatus::Done,
            format!("failed: {}", error),
            Some(exit_codes::FAILURE),
        ),
        WorkerOutcome::Crashed => state.mark_finished(
            task_id,
            TaskStatus::Done,
            "worker crashed",
            Some(exit_codes::FAILURE),
        ),
    }
}
