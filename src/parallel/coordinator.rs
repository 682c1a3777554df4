//! Runs up to `max_concurrency` iteration engines side by side.
//!
//! Each worker gets its own backlog and its own isolated workspace, so two
//! workers never touch the same files. A worker deregisters itself when its
//! engine returns; the liveness poll catches the ones that die first.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::backlog::BacklogStore;
use crate::config::RalphConfig;
use crate::engine::{Collaborators, IterationEngine};
use crate::error::{RalphError, Result};
use crate::exit_codes;
use crate::parallel::registry::{WorkerOutcome, WorkerRegistration, WorkerRegistry, WorkerReport};
use crate::parallel::CoordinatorConfig;
use crate::persist::absolute_path;

/// Result of [`WorkerCoordinator::run_all`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorSummary {
    pub workers: Vec<WorkerReport>,
    /// Backlogs that never got a worker, with the reason.
    pub launch_failures: Vec<(PathBuf, String)>,
    pub peak_alive: usize,
}

impl CoordinatorSummary {
    /// Failure if any worker failed, success if every backlog completed,
    /// partial otherwise.
    pub fn exit_code(&self) -> i32 {
        let codes: Vec<i32> = self.workers.iter().map(|w| w.outcome.exit_code()).collect();
        if !self.launch_failures.is_empty() || codes.contains(&exit_codes::FAILURE) {
            exit_codes::FAILURE
        } else if codes.iter().all(|c| *c == exit_codes::SUCCESS) {
            exit_codes::SUCCESS
        } else {
            exit_codes::PARTIAL
        }
    }
}

/// Launches, watches and deregisters workers.
pub struct WorkerCoordinator {
    config: CoordinatorConfig,
    ralph: RalphConfig,
    root: PathBuf,
    collaborators: Collaborators,
    registry: Arc<RwLock<WorkerRegistry>>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl WorkerCoordinator {
    /// `root` is the project whose `.ralph` directory holds every worker's
    /// checkpoints and logs.
    pub fn new(root: &Path, ralph: &RalphConfig, collaborators: Collaborators) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config: ralph.coordinator.clone(),
            ralph: ralph.clone(),
            root: root.to_path_buf(),
            collaborators,
            registry: Arc::new(RwLock::new(WorkerRegistry::new())),
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<RwLock<WorkerRegistry>> {
        Arc::clone(&self.registry)
    }

    /// False once the active worker count reaches `max_concurrency`.
    pub async fn can_start(&self) -> bool {
        !self.is_shutting_down()
            && self.registry.read().await.active_count() < self.config.max_concurrency
    }

    pub async fn is_alive(&self, worker_id: &str) -> bool {
        self.registry.read().await.is_alive(worker_id)
    }

    pub async fn active_count(&self) -> usize {
        self.registry.read().await.active_count()
    }

    pub async fn active(&self) -> Vec<WorkerRegistration> {
        self.registry.read().await.active()
    }

    /// Start a worker for the backlog at `backlog_path`.
    ///
    /// Fails with [`RalphError::CoordinatorFull`] when no slot is free.
    pub async fn launch(&self, backlog_path: &Path) -> Result<String> {
        // The agent sees this path from inside its workspace
        let backlog_path = absolute_path(backlog_path)?;
        let store = BacklogStore::new(&backlog_path, self.ralph.lock.clone());
        let backlog = store.load_validated()?;
        let worker_id = format!(
            "worker-{}-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst),
            backlog.lineage()
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);

        // Reserve the slot before the slow workspace copy
        {
            let mut registry = self.registry.write().await;
            if self.is_shutting_down() || registry.active_count() >= self.config.max_concurrency {
                return Err(RalphError::CoordinatorFull(self.config.max_concurrency));
            }
            registry.register(
                WorkerRegistration {
                    worker_id: worker_id.clone(),
                    project: backlog.project.clone(),
                    backlog_path: backlog_path.clone(),
                    story_ids: backlog.incomplete_ids(),
                    workspace: PathBuf::new(),
                    started_at: Utc::now(),
                },
                cancel_tx,
            );
        }

        let prepared = self.prepare(&worker_id, store).await;
        let (engine, workspace) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(worker_id = %worker_id, error = %err, "worker failed to start");
                let mut registry = self.registry.write().await;
                registry.deregister(
                    &worker_id,
                    WorkerOutcome::Failed {
                        error: err.to_string(),
                    },
                    None,
                )?;
                return Err(err);
            }
        };
        let mut engine = engine.with_cancellation(cancel_rx);

        // Holding the write lock until the handle is attached keeps a fast
        // worker from deregistering before it is fully registered.
        let mut registry = self.registry.write().await;
        registry.set_workspace(&worker_id, workspace.clone());

        let task_registry = Arc::clone(&self.registry);
        let task_worker_id = worker_id.clone();
        let vcs = Arc::clone(&self.collaborators.vcs);
        let remove_workspace = self.config.remove_workspaces;
        let task_workspace = workspace.clone();
        let handle = tokio::spawn(async move {
            let result = engine.run().await;
            let (outcome, run) = match result {
                Ok(report) => (
                    WorkerOutcome::Finished {
                        outcome: report.outcome.clone(),
                    },
                    Some(report),
                ),
                Err(err) => {
                    warn!(worker_id = %task_worker_id, error = %err, "worker engine failed");
                    (
                        WorkerOutcome::Failed {
                            error: err.to_string(),
                        },
                        None,
                    )
                }
            };
            let label = outcome.label();
            match task_registry
                .write()
                .await
                .deregister(&task_worker_id, outcome, run)
            {
                Ok(_) => info!(worker_id = %task_worker_id, outcome = label, "worker finished"),
                Err(err) => debug!(worker_id = %task_worker_id, error = %err, "worker already deregistered"),
            }

            if remove_workspace {
                if let Err(err) = vcs.remove_workspace(&task_workspace).await {
                    warn!(workspace = %task_workspace.display(), error = %err, "failed to remove workspace");
                }
            }
        });
        registry.attach(&worker_id, handle);
        drop(registry);

        info!(
            worker_id = %worker_id,
            backlog = %backlog_path.display(),
            workspace = %workspace.display(),
            "worker launched"
        );
        Ok(worker_id)
    }

    async fn prepare(
        &self,
        worker_id: &str,
        store: BacklogStore,
    ) -> Result<(IterationEngine, PathBuf)> {
        let workspace = self
            .collaborators
            .vcs
            .isolate_workspace(&self.config.source_ref, worker_id)
            .await?;
        let engine = IterationEngine::new(
            &self.root,
            workspace.clone(),
            store,
            &self.ralph,
            self.collaborators.clone(),
        )?;
        Ok((engine, workspace))
    }

    /// Remove a worker explicitly, asking its engine to stop first.
    pub async fn deregister(&self, worker_id: &str, outcome: WorkerOutcome) -> Result<WorkerReport> {
        let mut registry = self.registry.write().await;
        registry.cancel(worker_id)?;
        registry.deregister(worker_id, outcome, None)
    }

    /// Ask one worker's engine to stop between iterations.
    pub async fn cancel_worker(&self, worker_id: &str) -> Result<()> {
        self.registry.read().await.cancel(worker_id)
    }

    /// Stop launching and ask every running engine to stop.
    pub async fn cancel_all(&self) {
        self.shutdown.send_replace(true);
        self.registry.read().await.cancel_all();
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Deregister workers whose task exited without doing so itself.
    pub async fn poll_liveness(&self) -> Vec<String> {
        let mut registry = self.registry.write().await;
        let exited = registry.exited_without_deregistering();
        for worker_id in &exited {
            warn!(worker_id = %worker_id, "worker exited without deregistering, marking crashed");
            if let Err(err) = registry.deregister(worker_id, WorkerOutcome::Crashed, None) {
                debug!(worker_id = %worker_id, error = %err, "crashed worker already gone");
            }
        }
        exited
    }

    /// Reports of workers that left since the last call.
    pub async fn take_finished(&self) -> Vec<WorkerReport> {
        self.registry.write().await.take_finished()
    }

    /// Run every backlog, at most `max_concurrency` at a time, and wait
    /// until all workers are gone.
    pub async fn run_all(&self, backlogs: &[PathBuf]) -> Result<CoordinatorSummary> {
        let mut pending: VecDeque<PathBuf> = backlogs.iter().cloned().collect();
        let mut launch_failures = Vec::new();
        info!(
            backlogs = pending.len(),
            max_concurrency = self.config.max_concurrency,
            "coordinator started"
        );

        loop {
            while !pending.is_empty() && self.can_start().await {
                let Some(path) = pending.pop_front() else {
                    break;
                };
                match self.launch(&path).await {
                    Ok(_) => {}
                    Err(RalphError::CoordinatorFull(_)) => {
                        pending.push_front(path);
                        break;
                    }
                    Err(err) => {
                        warn!(backlog = %path.display(), error = %err, "backlog not launched");
                        launch_failures.push((path, err.to_string()));
                    }
                }
            }

            self.poll_liveness().await;
            if self.is_shutting_down() {
                for path in pending.drain(..) {
                    launch_failures.push((path, "coordinator shut down".to_string()));
                }
            }
            if pending.is_empty() && self.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        let mut registry = self.registry.write().await;
        let summary = CoordinatorSummary {
            workers: registry.take_finished(),
            launch_failures,
            peak_alive: registry.peak_alive(),
        };
        info!(
            workers = summary.workers.len(),
            failed_launches = summary.launch_failures.len(),
            peak_alive = summary.peak_alive,
            "coordinator finished"
        );
        Ok(summary)
    }
}
