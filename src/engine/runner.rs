//! The single-backlog iteration loop.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::AgentTask;
use crate::backlog::{select_next_story, BacklogStore, Selection, Story};
use crate::checkpoint::RecoveryManager;
use crate::complexity::{AttemptObservation, ComplexityMonitor, SignalLog};
use crate::config::{state_dir, RalphConfig};
use crate::engine::audit::{AuditLog, AuditRecord};
use crate::engine::state::{CycleOutcome, EngineState, RunOutcome, RunReport};
use crate::engine::{Collaborators, EngineConfig};
use crate::error::{BacklogError, RalphError, Result};
use crate::split::{SplitOutcome, Splitter};
use crate::timeout::{SessionHeartbeat, TimeoutConfig};

/// What the loop does after a split check.
enum SplitStep {
    /// Keep working on the same story.
    Proceed,
    /// The story was replaced by sub-stories; select again.
    Reselect,
    /// The split could not be applied; stop the run.
    Halt(RunOutcome),
}

/// Everything one cycle produced, for the audit log and the checkpoint.
#[derive(Debug)]
struct CycleRecord {
    outcome: CycleOutcome,
    reason: Option<String>,
    agent_notes: String,
    gate_failures: Vec<String>,
    warnings: Vec<String>,
    elapsed: Duration,
    timed_out: bool,
    error: Option<String>,
    complexity_score: f64,
    claims_all_complete: bool,
}

impl CycleRecord {
    fn new(elapsed: Duration, timed_out: bool) -> Self {
        Self {
            outcome: CycleOutcome::Retry,
            reason: None,
            agent_notes: String::new(),
            gate_failures: Vec::new(),
            warnings: Vec::new(),
            elapsed,
            timed_out,
            error: None,
            complexity_score: 0.0,
            claims_all_complete: false,
        }
    }

    fn finish(mut self, outcome: CycleOutcome, reason: Option<String>) -> Self {
        self.outcome = outcome;
        self.reason = reason;
        self
    }

    fn audit(&self, iteration: u32, story_id: &str) -> AuditRecord {
        AuditRecord {
            timestamp: Utc::now(),
            iteration,
            story_id: story_id.to_string(),
            outcome: self.outcome,
            agent_notes: self.agent_notes.clone(),
            gate_failures: self.gate_failures.clone(),
            warnings: self.warnings.clone(),
            duration_ms: self.elapsed.as_millis() as u64,
            complexity_score: self.complexity_score,
            timed_out: self.timed_out,
            error: self.error.clone(),
        }
    }
}

/// Drives one backlog through `SelectStory -> Delegate -> Validate` cycles.
///
/// One engine owns one backlog's checkpoint stream and is its only writer
/// while it runs, apart from an approved split which goes through the same
/// locked store.
pub struct IterationEngine {
    config: EngineConfig,
    timeouts: TimeoutConfig,
    root: PathBuf,
    workspace: PathBuf,
    store: BacklogStore,
    collaborators: Collaborators,
    recovery: RecoveryManager,
    monitor: ComplexityMonitor,
    splitter: Splitter,
    audit: AuditLog,
    heartbeat: SessionHeartbeat,
    cancel: Option<watch::Receiver<bool>>,
    state: EngineState,
}

impl IterationEngine {
    /// Build an engine for the backlog behind `store`.
    ///
    /// `root` holds the `.ralph` state directory; `workspace` is where the
    /// agent and the gates run (the project itself or an isolated copy).
    pub fn new(
        root: &Path,
        workspace: impl Into<PathBuf>,
        store: BacklogStore,
        config: &RalphConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let backlog = store.load_validated()?;
        let lineage = backlog.lineage();
        let recovery = RecoveryManager::new(root, &backlog, config.checkpoint.clone());
        let heartbeat = recovery.heartbeat(config.timeout.heartbeat_interval);
        let monitor = ComplexityMonitor::new(
            config.complexity.clone(),
            SignalLog::new(root, &lineage, config.lock.clone()),
        );
        let splitter = Splitter::new(
            root,
            &lineage,
            store.clone(),
            config.complexity.clone(),
            config.lock.clone(),
        );

        Ok(Self {
            config: config.engine.clone(),
            timeouts: config.timeout.clone(),
            root: root.to_path_buf(),
            workspace: workspace.into(),
            audit: AuditLog::new(root, &lineage, config.lock.clone()),
            store,
            collaborators,
            recovery,
            monitor,
            splitter,
            heartbeat,
            cancel: None,
            state: EngineState::SelectStory,
        })
    }

    /// Stop between iterations once `cancel` turns true.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Run until a terminal outcome. The session is marked cleanly shut
    /// down whenever this returns; only a killed process leaves it active.
    ///
    /// Fails with [`RalphError::SessionActive`], touching nothing, while
    /// another run of the same backlog is live.
    pub async fn run(&mut self) -> Result<RunReport> {
        self.recovery.begin_session()?;
        if let Err(err) = self.collaborators.vcs.track(&self.workspace).await {
            warn!(workspace = %self.workspace.display(), error = %err, "failed to track workspace");
        }

        let result = self.drive().await;

        self.heartbeat.stop().await;
        if let Err(err) = self.recovery.end_session() {
            warn!(lineage = self.recovery.lineage(), error = %err, "failed to mark clean shutdown");
        }
        result
    }

    async fn drive(&mut self) -> Result<RunReport> {
        let initial = self.store.load_validated()?;
        // Numbering continues after the latest checkpoint so a resumed run
        // never reuses an iteration.
        let mut iteration = self.recovery.latest()?.map(|c| c.iteration).unwrap_or(0);
        let mut report = RunReport {
            project: initial.project.clone(),
            lineage: self.recovery.lineage().to_string(),
            outcome: RunOutcome::BudgetExhausted,
            iterations_run: 0,
            last_iteration: iteration,
            completed: Vec::new(),
            blocked: Vec::new(),
            proposals: Vec::new(),
            remaining: Vec::new(),
        };
        info!(
            project = %report.project,
            lineage = %report.lineage,
            start_iteration = iteration + 1,
            max_iterations = self.config.max_iterations,
            "run started"
        );

        let outcome = loop {
            if self.cancel_requested() {
                info!(iteration, "cancellation requested, stopping");
                break RunOutcome::Cancelled;
            }

            self.transition(EngineState::SelectStory);
            let backlog = self.store.load_validated()?;
            let story = match select_next_story(&backlog) {
                Ok(Selection::Next(story)) => story.clone(),
                Ok(Selection::AllComplete) => {
                    self.transition(EngineState::AllStoriesComplete);
                    break RunOutcome::AllStoriesComplete;
                }
                Err(RalphError::Deadlock { incomplete }) => {
                    warn!(incomplete = ?incomplete, "no eligible story, halting");
                    break RunOutcome::Deadlock { incomplete };
                }
                Err(err) => return Err(err),
            };

            if report.iterations_run >= self.config.max_iterations {
                self.transition(EngineState::BudgetExhausted);
                break RunOutcome::BudgetExhausted;
            }

            self.monitor.begin_story(&story)?;
            // Signals carried over from an earlier run may already be over
            // the threshold.
            match self.consider_split(&story, &mut report).await? {
                SplitStep::Proceed => {}
                SplitStep::Reselect => continue,
                SplitStep::Halt(outcome) => break outcome,
            }

            iteration += 1;
            report.iterations_run += 1;
            let record = self.run_cycle(iteration, &story).await?;
            self.record_cycle(iteration, &story, &record)?;
            report.last_iteration = iteration;

            match record.outcome {
                CycleOutcome::Complete => {
                    report.completed.push(story.id.clone());
                    self.monitor.end_story();
                }
                CycleOutcome::Blocked => {
                    report.blocked.push((
                        story.id.clone(),
                        record.reason.clone().unwrap_or_default(),
                    ));
                }
                CycleOutcome::Retry => {}
            }

            if record.outcome != CycleOutcome::Complete {
                match self.consider_split(&story, &mut report).await? {
                    SplitStep::Proceed | SplitStep::Reselect => {}
                    SplitStep::Halt(outcome) => break outcome,
                }
            }

            if record.claims_all_complete {
                let remaining = self.store.load()?.incomplete_count();
                if remaining == 0 {
                    info!(iteration, "agent reported completion, backlog confirms");
                    self.transition(EngineState::AllStoriesComplete);
                    break RunOutcome::AllStoriesComplete;
                }
                warn!(
                    iteration,
                    remaining, "agent reported completion but stories remain, ignoring"
                );
            }
        };

        let finished = self.store.load()?;
        report.remaining = finished.incomplete_ids();
        report.outcome = outcome;

        if report.outcome.is_success() {
            if let Err(err) = self.store.archive(&state_dir(&self.root).join("archive")) {
                warn!(error = %err, "failed to archive completed backlog");
            }
        }
        info!(
            outcome = %report.outcome,
            iterations = report.iterations_run,
            completed = report.completed.len(),
            remaining = report.remaining.len(),
            "run finished"
        );
        Ok(report)
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    fn transition(&mut self, next: EngineState) {
        debug!(from = %self.state, to = %next, "engine transition");
        self.state = next;
    }

    /// One delegate-then-validate cycle with the session heartbeat running.
    async fn run_cycle(&mut self, iteration: u32, story: &Story) -> Result<CycleRecord> {
        self.heartbeat.start().await;
        let result = self.delegate_and_validate(iteration, story).await;
        self.heartbeat.stop().await;

        let record = result?;
        let next = match record.outcome {
            CycleOutcome::Complete => EngineState::Complete {
                story_id: story.id.clone(),
            },
            CycleOutcome::Retry => EngineState::Retry {
                story_id: story.id.clone(),
                reason: record.reason.clone().unwrap_or_default(),
            },
            CycleOutcome::Blocked => EngineState::Blocked {
                story_id: story.id.clone(),
                reason: record.reason.clone().unwrap_or_default(),
            },
        };
        self.transition(next);
        Ok(record)
    }

    async fn delegate_and_validate(&mut self, iteration: u32, story: &Story) -> Result<CycleRecord> {
        self.transition(EngineState::Delegate {
            story_id: story.id.clone(),
        });
        let task = AgentTask::from_story(story, iteration, &self.workspace, self.store.path());
        info!(story_id = %story.id, iteration, title = %story.title, "delegating story");

        let started = Instant::now();
        let attempt = self.collaborators.agent.attempt(&task).await;
        let elapsed = started.elapsed();
        let timed_out = self.timeouts.agent_overran(elapsed);

        let mut record = CycleRecord::new(elapsed, timed_out);
        let mut observation = AttemptObservation {
            elapsed,
            ..Default::default()
        };

        match attempt {
            Ok(report) => {
                debug!(story_id = %story.id, completed = report.completed, "agent returned");
                record.agent_notes = report.notes;
                record.claims_all_complete = report.claims_all_complete;
                observation.criteria_met = report.criteria_met;
                observation.modified_files = report.modified_files;
                observation.errors = report.errors;
                observation.clarifications = report.clarifications;
            }
            Err(err) if err.classify().is_retryable() => {
                warn!(story_id = %story.id, iteration, error = %err, "delegation failed");
                observation.errors.push(err.to_string());
                record.error = Some(err.to_string());
            }
            Err(err) => return Err(err),
        }

        if timed_out {
            let timeout = RalphError::Timeout {
                operation: "agent".to_string(),
                seconds: self.timeouts.agent_timeout.as_secs(),
            };
            warn!(
                story_id = %story.id,
                elapsed_secs = elapsed.as_secs(),
                "delegation ran past the agent timeout"
            );
            observation.errors.push(timeout.to_string());
            if record.error.is_none() {
                record.error = Some(timeout.to_string());
            }
        }

        if observation.modified_files.is_empty() {
            observation.modified_files =
                match self.collaborators.vcs.modified_files(&self.workspace).await {
                    Ok(files) => files,
                    Err(err) => {
                        warn!(error = %err, "could not list modified files");
                        Vec::new()
                    }
                };
        }
        if let Some(backlog_file) = self.backlog_relative_path() {
            observation.modified_files.retain(|path| *path != backlog_file);
        }
        record.complexity_score = self.monitor.observe_attempt(&observation)?.score;

        self.transition(EngineState::Validate {
            story_id: story.id.clone(),
        });
        // The backlog flag is the only completion signal trusted here.
        if !self.store.story_passes(&story.id)? {
            let reason = record
                .error
                .clone()
                .unwrap_or_else(|| "completion flag still false".to_string());
            info!(story_id = %story.id, iteration, reason = %reason, "story not complete, will retry");
            return Ok(record.finish(CycleOutcome::Retry, Some(reason)));
        }

        let gate_report = match self
            .collaborators
            .gates
            .run(&self.workspace, self.config.gate_level)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                warn!(story_id = %story.id, error = %err, "quality gates could not run");
                self.store.set_passes(&story.id, false)?;
                let reason = format!("quality gates could not run: {}", err);
                record.error = Some(err.to_string());
                return Ok(record.finish(CycleOutcome::Retry, Some(reason)));
            }
        };
        record.warnings = gate_report.warnings.clone();

        if gate_report.is_blocked() {
            let reason = gate_report.blocking_failures.join("; ");
            let note = format!("Blocked at iteration {}: {}", iteration, reason);
            self.store.update(|backlog| {
                let target = backlog
                    .story_mut(&story.id)
                    .ok_or_else(|| BacklogError::UnknownStory(story.id.clone()))?;
                target.passes = false;
                target.append_note(&note);
                Ok(())
            })?;
            warn!(story_id = %story.id, iteration, failures = %reason, "quality gates blocked story");
            record.gate_failures = gate_report.blocking_failures;
            return Ok(record.finish(CycleOutcome::Blocked, Some(reason)));
        }

        if self.config.snapshot_on_complete {
            let message = format!("feat: {} - {}", story.id, story.title);
            match self
                .collaborators
                .vcs
                .snapshot(&self.workspace, &message)
                .await
            {
                Ok(reference) => debug!(story_id = %story.id, snapshot = %reference, "workspace snapshot"),
                Err(err) => warn!(story_id = %story.id, error = %err, "workspace snapshot failed"),
            }
        }
        info!(story_id = %story.id, iteration, "story complete");
        Ok(record.finish(CycleOutcome::Complete, None))
    }

    /// Audit record plus checkpoint for a finished cycle.
    fn record_cycle(&self, iteration: u32, story: &Story, record: &CycleRecord) -> Result<()> {
        if let Err(err) = self.audit.append(&record.audit(iteration, &story.id)) {
            warn!(story_id = %story.id, iteration, error = %err, "failed to append audit record");
        }
        let context = json!({
            "outcome": record.outcome,
            "reason": record.reason,
            "complexity_score": record.complexity_score,
            "workspace": self.workspace.display().to_string(),
        });
        self.recovery.snapshot(Some(&story.id), iteration, context)?;
        Ok(())
    }

    async fn consider_split(&mut self, story: &Story, report: &mut RunReport) -> Result<SplitStep> {
        if !self.monitor.should_split() || self.splitter.has_proposal(&story.id)? {
            return Ok(SplitStep::Proceed);
        }

        let score = self.monitor.score();
        let proposal = self.splitter.propose(story, &score)?;
        let proposal_id = proposal.id.clone();
        report.proposals.push(proposal_id.clone());

        let approver = self.collaborators.approver.clone();
        match self.splitter.resolve(proposal, approver.as_ref()).await {
            Ok(SplitOutcome::Applied { sub_story_ids, .. }) => {
                info!(
                    story_id = %story.id,
                    proposal_id = %proposal_id,
                    sub_stories = ?sub_story_ids,
                    "story split, continuing with first sub-story"
                );
                self.monitor.end_story();
                Ok(SplitStep::Reselect)
            }
            Ok(SplitOutcome::Rejected { .. }) => {
                info!(story_id = %story.id, proposal_id = %proposal_id, "split rejected, story unchanged");
                Ok(SplitStep::Proceed)
            }
            Ok(SplitOutcome::Deferred { .. }) => {
                info!(story_id = %story.id, proposal_id = %proposal_id, "split deferred");
                Ok(SplitStep::Proceed)
            }
            Err(err) if !err.classify().is_retryable() => {
                warn!(story_id = %story.id, proposal_id = %proposal_id, error = %err, "split could not be applied");
                Ok(SplitStep::Halt(RunOutcome::SplitFailed {
                    story_id: story.id.clone(),
                    proposal_id,
                    message: err.to_string(),
                }))
            }
            Err(err) => Err(err),
        }
    }

    fn backlog_relative_path(&self) -> Option<String> {
        self.store
            .path()
            .strip_prefix(&self.workspace)
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::agent::AgentReport;
    use crate::backlog::Backlog;
    use crate::complexity::ComplexityConfig;
    use crate::engine::Collaborators;
    use crate::quality::GateReport;
    use crate::split::{AutoApprove, DeferApprover, ProposalStatus};
    use crate::testing::{
        blocked_report, stale_session, write_backlog, AgentStep, ScriptedAgent, StaticGates,
    };
    use crate::vcs::CopyVcs;

    fn two_story_backlog() -> Backlog {
        Backlog::new("demo", "main").with_stories(vec![
            Story::new("S1", "First", 1),
            Story::new("S2", "Second", 1).with_dependencies(&["S1"]),
        ])
    }

    fn collaborators(root: &Path, agent: ScriptedAgent, gates: StaticGates) -> Collaborators {
        Collaborators::new(
            Arc::new(agent),
            Arc::new(gates),
            Arc::new(CopyVcs::new(root, root.join(".ralph").join("workspaces"))),
            Arc::new(DeferApprover),
        )
    }

    fn engine(
        root: &Path,
        store: BacklogStore,
        config: &RalphConfig,
        collaborators: Collaborators,
    ) -> IterationEngine {
        IterationEngine::new(root, root, store, config, collaborators).expect("engine")
    }

    #[tokio::test]
    async fn test_runs_backlog_to_completion_in_dependency_order() {
        let temp_dir = TempDir::new().expect("temp dir");
        let root = temp_dir.path();
        let store = write_backlog(root, &two_story_backlog());
        let agent = ScriptedAgent::new();
        let calls = agent.calls();

        let mut engine = engine(
            root,
            store.clone(),
            &RalphConfig::default(),
            collaborators(root, agent, StaticGates::passing()),
        );
        let report = engine.run().await.expect("run");

        assert_eq!(report.outcome, RunOutcome::AllStoriesComplete);
        assert_eq!(report.completed, vec!["S1", "S2"]);
        assert_eq!(report.iterations_run, 2);
        assert_eq!(calls.lock().expect("calls").clone(), vec!["S1", "S2"]);
        assert_eq!(engine.audit_log().read_all().expect("audit").len(), 2);
        assert_eq!(engine.recovery().latest().expect("latest").map(|c| c.iteration), Some(2));
        assert!(!engine.recovery().detect_crash().expect("detect"));
        assert_eq!(engine.state(), &EngineState::AllStoriesComplete);
    }

    #[tokio::test]
    async fn test_budget_exhausted_is_partial() {
        let temp_dir = TempDir::new().expect("temp dir");
        let root = temp_dir.path();
        let store = write_backlog(root, &two_story_backlog());
        let agent = ScriptedAgent::new().with_default(AgentStep::no_progress());

        let mut config = RalphConfig::default();
        config.engine.max_iterations = 3;
        let mut engine = engine(root, store, &config, collaborators(root, agent, StaticGates::passing()));
        let report = engine.run().await.expect("run");

        assert_eq!(report.outcome, RunOutcome::BudgetExhausted);
        assert_eq!(report.exit_code(), crate::exit_codes::PARTIAL);
        assert_eq!(report.iterations_run, 3);
        assert_eq!(report.remaining, vec!["S1", "S2"]);
    }

    #[tokio::test]
    async fn test_blocking_gate_reverts_story_and_notes_reason() {
        let temp_dir = TempDir::new().expect("temp dir");
        let root = temp_dir.path();
        let store = write_backlog(
            root,
            &Backlog::new("demo", "main").with_stories(vec![Story::new("S1", "Only", 1)]),
        );
        let gates = StaticGates::sequence(vec![
            blocked_report("tests: 2 failing"),
            GateReport::passed(),
        ]);

        let mut engine = engine(
            root,
            store.clone(),
            &RalphConfig::default(),
            collaborators(root, ScriptedAgent::new(), gates),
        );
        let report = engine.run().await.expect("run");

        assert_eq!(report.outcome, RunOutcome::AllStoriesComplete);
        assert_eq!(report.blocked.len(), 1);
        assert_eq!(report.blocked[0].0, "S1");
        let audit = engine.audit_log().read_all().expect("audit");
        assert_eq!(audit[0].outcome, CycleOutcome::Blocked);
        assert_eq!(audit[0].gate_failures, vec!["tests: 2 failing"]);
        let notes = store.load().expect("load").story("S1").expect("S1").notes.clone();
        assert!(notes.contains("Blocked at iteration 1: tests: 2 failing"));
    }

    #[tokio::test]
    async fn test_agent_completion_claim_is_not_trusted() {
        let temp_dir = TempDir::new().expect("temp dir");
        let root = temp_dir.path();
        let store = write_backlog(root, &two_story_backlog());
        let claim = AgentReport {
            claims_all_complete: true,
            ..Default::default()
        };
        let agent = ScriptedAgent::new().with_default(AgentStep::report(false, claim));

        let mut config = RalphConfig::default();
        config.engine.max_iterations = 2;
        let mut engine = engine(root, store.clone(), &config, collaborators(root, agent, StaticGates::passing()));
        let report = engine.run().await.expect("run");

        assert_eq!(report.outcome, RunOutcome::BudgetExhausted);
        assert_eq!(store.load().expect("load").incomplete_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_delegation_is_retried() {
        let temp_dir = TempDir::new().expect("temp dir");
        let root = temp_dir.path();
        let store = write_backlog(
            root,
            &Backlog::new("demo", "main").with_stories(vec![Story::new("S1", "Only", 1)]),
        );
        let agent = ScriptedAgent::new().with_steps(vec![AgentStep::fail("exit status 1")]);

        let mut engine = engine(
            root,
            store,
            &RalphConfig::default(),
            collaborators(root, agent, StaticGates::passing()),
        );
        let report = engine.run().await.expect("run");

        assert_eq!(report.outcome, RunOutcome::AllStoriesComplete);
        assert_eq!(report.iterations_run, 2);
        let audit = engine.audit_log().read_all().expect("audit");
        assert_eq!(audit[0].outcome, CycleOutcome::Retry);
        assert!(audit[0].error.as_deref().unwrap_or_default().contains("exit status 1"));
    }

    #[tokio::test]
    async fn test_dependency_deadlock_halts() {
        let temp_dir = TempDir::new().expect("temp dir");
        let root = temp_dir.path();
        let mut parent = Story::new("S1", "Split parent", 1);
        parent.split = true;
        let store = write_backlog(
            root,
            &Backlog::new("demo", "main").with_stories(vec![
                parent,
                Story::new("S2", "Waits forever", 2).with_dependencies(&["S1"]),
            ]),
        );

        let mut engine = engine(
            root,
            store,
            &RalphConfig::default(),
            collaborators(root, ScriptedAgent::new(), StaticGates::passing()),
        );
        let report = engine.run().await.expect("run");

        assert_eq!(
            report.outcome,
            RunOutcome::Deadlock {
                incomplete: vec!["S2".into()]
            }
        );
        assert_eq!(report.exit_code(), crate::exit_codes::FAILURE);
        assert_eq!(report.iterations_run, 0);
    }

    fn noisy_attempt() -> AgentStep {
        AgentStep::report(
            false,
            AgentReport {
                errors: (1..=5).map(|i| format!("compile error {}", i)).collect(),
                clarifications: vec!["which schema?".into(), "which table?".into()],
                ..Default::default()
            },
        )
    }

    fn low_threshold_config() -> RalphConfig {
        let mut config = RalphConfig::default();
        config.complexity = ComplexityConfig::default().with_threshold(1.5);
        config.engine.max_iterations = 6;
        config
    }

    #[tokio::test]
    async fn test_deferred_split_leaves_story_unmodified() {
        let temp_dir = TempDir::new().expect("temp dir");
        let root = temp_dir.path();
        let store = write_backlog(
            root,
            &Backlog::new("demo", "main").with_stories(vec![Story::new("S1", "Big", 1)
                .with_criteria(&["a", "b", "c", "d"])]),
        );
        let agent = ScriptedAgent::new()
            .with_steps(vec![noisy_attempt()])
            .with_default(AgentStep::no_progress());

        let mut config = low_threshold_config();
        config.engine.max_iterations = 2;
        let mut engine = engine(root, store.clone(), &config, collaborators(root, agent, StaticGates::passing()));
        let report = engine.run().await.expect("run");

        assert_eq!(report.proposals.len(), 1);
        let backlog = store.load().expect("load");
        let story = backlog.story("S1").expect("S1");
        assert!(!story.split);
        assert!(!story.passes);
        assert_eq!(backlog.user_stories.len(), 1);

        let splitter = Splitter::new(
            root,
            "main",
            store,
            ComplexityConfig::default(),
            Default::default(),
        );
        let proposal = splitter.get(&report.proposals[0]).expect("proposal");
        assert_eq!(proposal.status, ProposalStatus::Deferred);
    }

    #[tokio::test]
    async fn test_approved_split_continues_with_sub_stories() {
        let temp_dir = TempDir::new().expect("temp dir");
        let root = temp_dir.path();
        let store = write_backlog(
            root,
            &Backlog::new("demo", "main").with_stories(vec![Story::new("S1", "Big", 1)
                .with_criteria(&["a", "b", "c", "d"])]),
        );
        let agent = ScriptedAgent::new().with_steps(vec![noisy_attempt()]);
        let calls = agent.calls();
        let collaborators = collaborators(root, agent, StaticGates::passing())
            .with_approver(Arc::new(AutoApprove));

        let mut engine = engine(root, store.clone(), &low_threshold_config(), collaborators);
        let report = engine.run().await.expect("run");

        assert_eq!(report.outcome, RunOutcome::AllStoriesComplete);
        assert_eq!(report.completed, vec!["S1.1", "S1.2"]);
        assert_eq!(calls.lock().expect("calls").clone(), vec!["S1", "S1.1", "S1.2"]);
        let backlog = store.load().expect("load");
        let parent = backlog.story("S1").expect("S1");
        assert!(parent.split);
        assert!(!parent.passes);
    }

    #[tokio::test]
    async fn test_resumed_run_continues_iteration_numbering() {
        let temp_dir = TempDir::new().expect("temp dir");
        let root = temp_dir.path();
        let backlog = two_story_backlog();
        let store = write_backlog(root, &backlog);
        let recovery = RecoveryManager::new(root, &backlog, Default::default());
        recovery.begin_session().expect("session");
        recovery
            .snapshot(Some("S1"), 4, serde_json::Value::Null)
            .expect("checkpoint");
        stale_session(recovery.sessions());
        assert!(recovery.detect_crash().expect("detect"));
        assert_eq!(recovery.resume().expect("resume").iteration, 4);

        let mut engine = engine(
            root,
            store,
            &RalphConfig::default(),
            collaborators(root, ScriptedAgent::new(), StaticGates::passing()),
        );
        let report = engine.run().await.expect("run");

        assert_eq!(report.last_iteration, 6);
        let iterations: Vec<u32> = engine
            .audit_log()
            .read_all()
            .expect("audit")
            .iter()
            .map(|r| r.iteration)
            .collect();
        assert_eq!(iterations, vec![5, 6]);
        assert!(!engine.recovery().detect_crash().expect("detect"));
    }

    #[tokio::test]
    async fn test_refuses_to_run_beside_a_live_session() {
        let temp_dir = TempDir::new().expect("temp dir");
        let root = temp_dir.path();
        let backlog = two_story_backlog();
        let store = write_backlog(root, &backlog);
        let running = RecoveryManager::new(root, &backlog, Default::default());
        let session = running.begin_session().expect("session");
        let agent = ScriptedAgent::new();
        let calls = agent.calls();

        let mut engine = engine(
            root,
            store.clone(),
            &RalphConfig::default(),
            collaborators(root, agent, StaticGates::passing()),
        );
        match engine.run().await {
            Err(RalphError::SessionActive { pid, .. }) => assert_eq!(pid, session.pid),
            other => panic!("expected SessionActive, got {:?}", other),
        }

        assert!(calls.lock().expect("calls").is_empty());
        assert_eq!(store.load().expect("load").incomplete_count(), 2);
        // The live run's session is left as it was
        let after = running.sessions().load().expect("load").expect("session");
        assert!(after.is_open());
        assert_eq!(after.started_at, session.started_at);
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_iteration() {
        let temp_dir = TempDir::new().expect("temp dir");
        let root = temp_dir.path();
        let store = write_backlog(root, &two_story_backlog());
        let (tx, rx) = watch::channel(false);
        tx.send(true).expect("send");

        let mut engine = engine(
            root,
            store,
            &RalphConfig::default(),
            collaborators(root, ScriptedAgent::new(), StaticGates::passing()),
        )
        .with_cancellation(rx);
        let report = engine.run().await.expect("run");

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.iterations_run, 0);
    }
}
