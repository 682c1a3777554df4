//! Hermetic stand-ins for the agent and the gate runner, used by unit tests.
//!
//! `CopyVcs` is a real implementation and needs no fake; it is re-exported
//! here so tests pull everything from one place.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::agent::{AgentReport, AgentTask, ImplementationAgent};
use crate::backlog::{Backlog, BacklogStore, Story, DEFAULT_BACKLOG_FILE};
use crate::checkpoint::SessionStore;
use crate::engine::Collaborators;
use crate::error::{RalphError, Result};
use crate::lock::LockConfig;
use crate::quality::{GateLevel, GateReport, QualityGateRunner};
use crate::split::DeferApprover;

pub use crate::vcs::CopyVcs;

/// Write `backlog` as `prd.json` under `root` and return a store for it.
pub fn write_backlog(root: &Path, backlog: &Backlog) -> BacklogStore {
    let store = BacklogStore::new(root.join(DEFAULT_BACKLOG_FILE), LockConfig::default());
    store.save(backlog).expect("write test backlog");
    store
}

/// A small source tree under `root/source` plus one single-story backlog
/// per name under `root/backlogs/<name>/prd.json`. Returns the backlog paths.
pub fn multi_backlog_project(root: &Path, names: &[&str]) -> Vec<PathBuf> {
    let source = root.join("source");
    fs::create_dir_all(source.join("src")).expect("create source tree");
    fs::write(source.join("src").join("lib.rs"), "pub fn demo() {}\n").expect("write source");

    names
        .iter()
        .map(|name| {
            let dir = root.join("backlogs").join(name);
            fs::create_dir_all(&dir).expect("create backlog dir");
            let backlog = Backlog::new(*name, format!("ralph/{}", name))
                .with_stories(vec![Story::new(name.to_uppercase(), "Work", 1)]);
            write_backlog(&dir, &backlog).path().to_path_buf()
        })
        .collect()
}

/// Collaborators for [`multi_backlog_project`]: passing gates, copy-based
/// workspaces derived from `root/source`, deferring approver.
pub fn copy_collaborators(root: &Path, agent: Arc<dyn ImplementationAgent>) -> Collaborators {
    Collaborators::new(
        agent,
        Arc::new(StaticGates::passing()),
        Arc::new(CopyVcs::new(
            root.join("source"),
            root.join(".ralph").join("workspaces"),
        )),
        Arc::new(DeferApprover),
    )
}

/// Push the open session's heartbeat an hour into the past, as if its
/// process had died without a clean shutdown.
pub fn stale_session(sessions: &SessionStore) {
    let mut session = sessions.load().expect("load session").expect("open session");
    session.last_heartbeat = chrono::Utc::now() - chrono::Duration::hours(1);
    sessions.save(&session).expect("save session");
}

/// Gate report with a single blocking failure.
pub fn blocked_report(failure: &str) -> GateReport {
    GateReport {
        all_passed: false,
        blocking_failures: vec![failure.to_string()],
        warnings: Vec::new(),
        results: Vec::new(),
    }
}

/// What the scripted agent does on one call.
#[derive(Debug, Clone)]
pub enum AgentStep {
    /// Optionally flip the story's flag, then return the report.
    Report { passes: bool, report: AgentReport },
    /// Fail the call.
    Fail(String),
}

impl AgentStep {
    /// Mark the story complete.
    pub fn pass() -> Self {
        AgentStep::Report {
            passes: true,
            report: AgentReport {
                completed: true,
                ..Default::default()
            },
        }
    }

    /// Return without touching the backlog.
    pub fn no_progress() -> Self {
        AgentStep::Report {
            passes: false,
            report: AgentReport::default(),
        }
    }

    pub fn report(passes: bool, report: AgentReport) -> Self {
        AgentStep::Report { passes, report }
    }

    pub fn fail(message: &str) -> Self {
        AgentStep::Fail(message.to_string())
    }
}

/// Agent that plays back a fixed script, then repeats a default step.
pub struct ScriptedAgent {
    steps: Mutex<VecDeque<AgentStep>>,
    default: AgentStep,
    delay: Duration,
    calls: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl Default for ScriptedAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            default: AgentStep::pass(),
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_steps(self, steps: Vec<AgentStep>) -> Self {
        *self.steps.lock().expect("steps lock") = steps.into();
        self
    }

    pub fn with_default(mut self, step: AgentStep) -> Self {
        self.default = step;
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Story ids in call order.
    pub fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }

    /// Highest number of calls seen running at once.
    pub fn peak_in_flight(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak_in_flight)
    }
}

#[async_trait]
impl ImplementationAgent for ScriptedAgent {
    async fn attempt(&self, task: &AgentTask) -> Result<AgentReport> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(task.story_id.clone());
        let step = self
            .steps
            .lock()
            .expect("steps lock")
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match step {
            AgentStep::Report { passes, report } => {
                if passes {
                    BacklogStore::new(&task.backlog_path, LockConfig::default())
                        .set_passes(&task.story_id, true)?;
                }
                Ok(report)
            }
            AgentStep::Fail(message) => Err(RalphError::Agent {
                story_id: task.story_id.clone(),
                message,
            }),
        }
    }
}

/// Gate runner returning canned reports in order, then a default.
pub struct StaticGates {
    reports: Mutex<VecDeque<GateReport>>,
    default: GateReport,
    levels: Arc<Mutex<Vec<GateLevel>>>,
}

impl StaticGates {
    pub fn passing() -> Self {
        Self::sequence(Vec::new())
    }

    /// Always block with `failure`.
    pub fn blocking(failure: &str) -> Self {
        Self {
            reports: Mutex::new(VecDeque::new()),
            default: blocked_report(failure),
            levels: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Play `reports` back in order, then pass.
    pub fn sequence(reports: Vec<GateReport>) -> Self {
        Self {
            reports: Mutex::new(reports.into()),
            default: GateReport::passed(),
            levels: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Levels the gates were run at, in call order.
    pub fn levels(&self) -> Arc<Mutex<Vec<GateLevel>>> {
        Arc::clone(&self.levels)
    }
}

#[async_trait]
impl QualityGateRunner for StaticGates {
    async fn run(&self, _workspace: &Path, level: GateLevel) -> Result<GateReport> {
        self.levels.lock().expect("levels lock").push(level);
        let report = self
            .reports
            .lock()
            .expect("reports lock")
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        Ok(report)
    }
}
