//! Worker registrations and the outcomes recorded when they leave.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::{RunOutcome, RunReport};
use crate::error::{RalphError, Result};
use crate::exit_codes;

/// Who a worker is and what it was given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub project: String,
    pub backlog_path: PathBuf,
    /// Open story ids at launch.
    pub story_ids: Vec<String>,
    pub workspace: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// How a worker left the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// The engine returned; its own outcome says how far it got.
    Finished { outcome: RunOutcome },
    /// The engine returned an error.
    Failed { error: String },
    /// The worker exited without deregistering itself.
    Crashed,
}

impl WorkerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerOutcome::Finished { outcome } if outcome.is_success() => "completed",
            WorkerOutcome::Finished { .. } => "stopped",
            WorkerOutcome::Failed { .. } => "failed",
            WorkerOutcome::Crashed => "crashed",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerOutcome::Finished { outcome } => outcome.exit_code(),
            WorkerOutcome::Failed { .. } | WorkerOutcome::Crashed => exit_codes::FAILURE,
        }
    }
}

/// Final record for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub registration: WorkerRegistration,
    pub outcome: WorkerOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunReport>,
    pub ended_at: DateTime<Utc>,
}

impl WorkerReport {
    pub fn worker_id(&self) -> &str {
        &self.registration.worker_id
    }
}

pub(crate) struct ActiveWorker {
    pub(crate) registration: WorkerRegistration,
    pub(crate) handle: Option<JoinHandle<()>>,
    pub(crate) cancel: watch::Sender<bool>,
}

impl ActiveWorker {
    /// Alive while its task has not exited.
    pub(crate) fn is_alive(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| !h.is_finished())
    }
}

/// Active workers plus the reports of the ones that left.
#[derive(Default)]
pub struct WorkerRegistry {
    active: HashMap<String, ActiveWorker>,
    finished: Vec<WorkerReport>,
    peak_alive: usize,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &mut self,
        registration: WorkerRegistration,
        cancel: watch::Sender<bool>,
    ) {
        self.active.insert(
            registration.worker_id.clone(),
            ActiveWorker {
                registration,
                handle: None,
                cancel,
            },
        );
        self.peak_alive = self.peak_alive.max(self.active.len());
    }

    pub(crate) fn set_workspace(&mut self, worker_id: &str, workspace: PathBuf) {
        if let Some(worker) = self.active.get_mut(worker_id) {
            worker.registration.workspace = workspace;
        }
    }

    pub(crate) fn attach(&mut self, worker_id: &str, handle: JoinHandle<()>) {
        if let Some(worker) = self.active.get_mut(worker_id) {
            worker.handle = Some(handle);
        }
    }

    /// Remove a worker and record how it ended.
    pub fn deregister(
        &mut self,
        worker_id: &str,
        outcome: WorkerOutcome,
        run: Option<RunReport>,
    ) -> Result<WorkerReport> {
        let worker = self
            .active
            .remove(worker_id)
            .ok_or_else(|| RalphError::UnknownWorker(worker_id.to_string()))?;
        let report = WorkerReport {
            registration: worker.registration,
            outcome,
            run,
            ended_at: Utc::now(),
        };
        self.finished.push(report.clone());
        Ok(report)
    }

    pub fn is_alive(&self, worker_id: &str) -> bool {
        self.active.get(worker_id).is_some_and(ActiveWorker::is_alive)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active(&self) -> Vec<WorkerRegistration> {
        let mut workers: Vec<_> = self
            .active
            .values()
            .map(|w| w.registration.clone())
            .collect();
        workers.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        workers
    }

    /// Registered workers whose task already exited.
    pub fn exited_without_deregistering(&self) -> Vec<String> {
        self.active
            .iter()
            .filter(|(_, w)| !w.is_alive())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub(crate) fn cancel(&self, worker_id: &str) -> Result<()> {
        let worker = self
            .active
            .get(worker_id)
            .ok_or_else(|| RalphError::UnknownWorker(worker_id.to_string()))?;
        // Receiver gone means the engine already finished
        let _ = worker.cancel.send(true);
        Ok(())
    }

    pub(crate) fn cancel_all(&self) {
        for worker in self.active.values() {
            let _ = worker.cancel.send(true);
        }
    }

    pub fn finished(&self) -> &[WorkerReport] {
        &self.finished
    }

    pub fn take_finished(&mut self) -> Vec<WorkerReport> {
        std::mem::take(&mut self.finished)
    }

    /// Most workers ever registered at the same time.
    pub fn peak_alive(&self) -> usize {
        self.peak_alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(id: &str) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: id.to_string(),
            project: "demo".into(),
            backlog_path: PathBuf::from("/tmp/prd.json"),
            story_ids: vec!["US-001".into()],
            workspace: PathBuf::from("/tmp/ws").join(id),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_register_and_deregister() {
        let mut registry = WorkerRegistry::new();
        let (tx, _rx) = watch::channel(false);
        registry.register(registration("worker-1"), tx);

        assert_eq!(registry.active_count(), 1);
        assert!(registry.is_alive("worker-1"));

        let report = registry
            .deregister(
                "worker-1",
                WorkerOutcome::Finished {
                    outcome: RunOutcome::AllStoriesComplete,
                },
                None,
            )
            .expect("deregister");
        assert_eq!(report.outcome.label(), "completed");
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.is_alive("worker-1"));
        assert_eq!(registry.finished().len(), 1);
        assert_eq!(registry.peak_alive(), 1);
    }

    #[test]
    fn test_deregister_unknown_worker() {
        let mut registry = WorkerRegistry::new();
        let err = registry
            .deregister("ghost", WorkerOutcome::Crashed, None)
            .expect_err("unknown");
        assert!(matches!(err, RalphError::UnknownWorker(_)));
    }

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(WorkerOutcome::Crashed.exit_code(), exit_codes::FAILURE);
        assert_eq!(
            WorkerOutcome::Finished {
                outcome: RunOutcome::BudgetExhausted
            }
            .exit_code(),
            exit_codes::PARTIAL
        );
    }

    #[tokio::test]
    async fn test_exited_task_detected() {
        let mut registry = WorkerRegistry::new();
        let (tx, _rx) = watch::channel(false);
        registry.register(registration("worker-1"), tx);
        let handle = tokio::spawn(async {});
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        registry.attach("worker-1", handle);

        assert!(!registry.is_alive("worker-1"));
        assert_eq!(registry.exited_without_deregistering(), vec!["worker-1"]);
    }
}
