//! Crash detection and resume.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::session::{Session, SessionStore};
use super::store::{Checkpoint, CheckpointRef, CheckpointStore};
use super::CheckpointConfig;
use crate::backlog::Backlog;
use crate::error::{RalphError, Result};
use crate::timeout::SessionHeartbeat;

/// Where a resumed run picks up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumePoint {
    /// Last iteration that completed; the next cycle runs `iteration + 1`.
    pub iteration: u32,
    pub story_id: Option<String>,
}

/// Operator's answer to a crash prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Resume,
    /// Discard the session and all checkpoints.
    FreshStart,
    /// Leave state untouched and exit.
    Decline,
}

/// What the operator is shown after a crash.
#[derive(Debug, Clone, Serialize)]
pub struct CrashReport {
    pub lineage: String,
    pub session: Session,
    pub last_iteration: Option<u32>,
    pub last_story_id: Option<String>,
    #[serde(with = "crate::config::duration_ms")]
    pub checkpoint_age: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub heartbeat_age: Duration,
    /// The crashed run went quiet for longer than `max_idle`.
    pub idle_exceeded: bool,
}

impl CrashReport {
    pub fn summary(&self) -> String {
        let checkpoint = match (self.last_iteration, &self.last_story_id) {
            (Some(iteration), Some(story)) => format!(
                "last checkpoint at iteration {} ({}), {}s old",
                iteration,
                story,
                self.checkpoint_age.as_secs()
            ),
            (Some(iteration), None) => format!(
                "last checkpoint at iteration {}, {}s old",
                iteration,
                self.checkpoint_age.as_secs()
            ),
            _ => "no checkpoint written".to_string(),
        };
        let idle = if self.idle_exceeded {
            format!(
                "; heartbeat stale for {}s",
                self.heartbeat_age.as_secs()
            )
        } else {
            String::new()
        };
        format!(
            "previous run of {} (pid {}) did not shut down cleanly: {}{}",
            self.lineage, self.session.pid, checkpoint, idle
        )
    }
}

/// Checkpoint stream plus session record for one backlog lineage.
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    backlog_id: String,
    lineage: String,
    checkpoints: CheckpointStore,
    sessions: SessionStore,
    config: CheckpointConfig,
}

impl RecoveryManager {
    pub fn new(root: &Path, backlog: &Backlog, config: CheckpointConfig) -> Self {
        let lineage = backlog.lineage();
        Self {
            backlog_id: backlog.project.clone(),
            checkpoints: CheckpointStore::new(root, &lineage),
            sessions: SessionStore::new(root, backlog.project.clone(), lineage.clone()),
            lineage,
            config,
        }
    }

    pub fn lineage(&self) -> &str {
        &self.lineage
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Record progress after a cycle.
    pub fn snapshot(
        &self,
        story_id: Option<&str>,
        iteration: u32,
        context: Value,
    ) -> Result<CheckpointRef> {
        let checkpoint = Checkpoint::new(
            self.backlog_id.clone(),
            self.lineage.clone(),
            iteration,
            story_id.map(str::to_string),
            context,
        );
        self.checkpoints.append(&checkpoint)
    }

    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        self.checkpoints.latest()
    }

    /// True when the last session was left open by a process that is gone
    /// or silent for longer than `max_idle`.
    pub fn detect_crash(&self) -> Result<bool> {
        Ok(self
            .sessions
            .load()?
            .map(|s| s.indicates_crash(self.config.max_idle))
            .unwrap_or(false))
    }

    /// The session of a run still in progress on this lineage, if any.
    pub fn live_session(&self) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .load()?
            .filter(|s| s.is_live(self.config.max_idle)))
    }

    /// Details for the crash prompt, or `None` if there was no crash.
    pub fn crash_report(&self) -> Result<Option<CrashReport>> {
        let session = match self.sessions.load()? {
            Some(session) if session.indicates_crash(self.config.max_idle) => session,
            _ => return Ok(None),
        };
        let latest = self.checkpoints.latest()?;
        let heartbeat_age = session.heartbeat_age();
        let checkpoint_age = latest
            .as_ref()
            .and_then(|c| c.age().to_std().ok())
            .unwrap_or_default();

        Ok(Some(CrashReport {
            lineage: self.lineage.clone(),
            last_iteration: latest.as_ref().map(|c| c.iteration),
            last_story_id: latest.and_then(|c| c.story_id),
            checkpoint_age,
            idle_exceeded: heartbeat_age >= self.config.max_idle,
            heartbeat_age,
            session,
        }))
    }

    /// Resumption point from the latest checkpoint. Read-only, so repeated
    /// calls agree.
    pub fn resume(&self) -> Result<ResumePoint> {
        Ok(match self.checkpoints.latest()? {
            Some(checkpoint) => ResumePoint {
                iteration: checkpoint.iteration,
                story_id: checkpoint.story_id,
            },
            None => ResumePoint {
                iteration: 0,
                story_id: None,
            },
        })
    }

    /// Discard session and checkpoints.
    pub fn fresh_start(&self) -> Result<()> {
        warn!(lineage = %self.lineage, "discarding session and checkpoints");
        self.sessions.discard()?;
        self.checkpoints.clear()
    }

    /// Apply the operator's decision; with no operator, resume.
    ///
    /// `operator` is raced against `resume_wait`. Non-interactive runs never
    /// poll it.
    pub async fn resolve_decision<F>(&self, operator: F) -> RecoveryDecision
    where
        F: Future<Output = Option<RecoveryDecision>>,
    {
        if !self.config.interactive {
            info!(lineage = %self.lineage, "non-interactive, resuming after crash");
            return RecoveryDecision::Resume;
        }
        match tokio::time::timeout(self.config.resume_wait, operator).await {
            Ok(Some(decision)) => decision,
            Ok(None) => RecoveryDecision::Resume,
            Err(_) => {
                info!(
                    lineage = %self.lineage,
                    waited_ms = self.config.resume_wait.as_millis() as u64,
                    "no operator answer, resuming"
                );
                RecoveryDecision::Resume
            }
        }
    }

    /// Mark this run active. Fails with [`RalphError::SessionActive`] while
    /// another run of the same lineage is live.
    pub fn begin_session(&self) -> Result<Session> {
        if let Some(live) = self.live_session()? {
            return Err(RalphError::SessionActive {
                lineage: self.lineage.clone(),
                pid: live.pid,
                heartbeat_secs: live.heartbeat_age().as_secs(),
            });
        }
        self.sessions.begin()
    }

    pub fn heartbeat(&self, interval: Duration) -> SessionHeartbeat {
        SessionHeartbeat::new(self.sessions.clone(), interval)
    }

    /// Write the clean-shutdown marker.
    pub fn end_session(&self) -> Result<()> {
        self.sessions.mark_clean_shutdown()
    }

    /// Explicit cleanup, keeping the newest `keep_checkpoints`.
    pub fn cleanup(&self) -> Result<usize> {
        let removed = self.checkpoints.prune(self.config.keep_checkpoints)?;
        if removed > 0 {
            info!(lineage = %self.lineage, removed, "pruned old checkpoints");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::Story;
    use crate::testing::stale_session;
    use serde_json::json;
    use tempfile::TempDir;

    fn backlog() -> Backlog {
        Backlog::new("Demo", "ralph/demo").with_stories(vec![Story::new("US-001", "One", 1)])
    }

    fn manager(root: &Path, config: CheckpointConfig) -> RecoveryManager {
        RecoveryManager::new(root, &backlog(), config)
    }

    #[test]
    fn test_crash_after_iteration_four() {
        let temp_dir = TempDir::new().expect("temp dir");
        let recovery = manager(temp_dir.path(), CheckpointConfig::default());

        recovery.begin_session().expect("begin");
        for i in 1..=4 {
            recovery
                .snapshot(Some("US-001"), i, json!({}))
                .expect("snapshot");
        }
        // Process dies here: no clean-shutdown marker, heartbeat goes stale.
        stale_session(recovery.sessions());

        let restarted = manager(temp_dir.path(), CheckpointConfig::default());
        assert!(restarted.detect_crash().expect("detect"));
        let point = restarted.resume().expect("resume");
        assert_eq!(point.iteration, 4);
        assert_eq!(point.story_id.as_deref(), Some("US-001"));
    }

    #[test]
    fn test_resume_is_idempotent() {
        let temp_dir = TempDir::new().expect("temp dir");
        let recovery = manager(temp_dir.path(), CheckpointConfig::default());
        recovery.begin_session().expect("begin");
        recovery.snapshot(Some("US-001"), 2, json!({})).expect("snapshot");

        let first = recovery.resume().expect("first");
        let second = recovery.resume().expect("second");
        assert_eq!(first, second);
        assert_eq!(recovery.latest().expect("latest").expect("some").iteration, 2);
    }

    #[test]
    fn test_clean_shutdown_is_not_a_crash() {
        let temp_dir = TempDir::new().expect("temp dir");
        let recovery = manager(temp_dir.path(), CheckpointConfig::default());

        assert!(!recovery.detect_crash().expect("no session"));
        recovery.begin_session().expect("begin");
        recovery.end_session().expect("end");
        assert!(!recovery.detect_crash().expect("clean"));
        assert!(recovery.crash_report().expect("report").is_none());
    }

    #[test]
    fn test_live_run_is_not_a_crash_and_blocks_a_second_run() {
        let temp_dir = TempDir::new().expect("temp dir");
        let running = manager(temp_dir.path(), CheckpointConfig::default());
        running.begin_session().expect("begin");

        let second = manager(temp_dir.path(), CheckpointConfig::default());
        assert!(!second.detect_crash().expect("detect"));
        assert!(second.crash_report().expect("report").is_none());
        assert_eq!(
            second.live_session().expect("live").map(|s| s.pid),
            Some(std::process::id())
        );
        match second.begin_session() {
            Err(RalphError::SessionActive { lineage, pid, .. }) => {
                assert_eq!(lineage, "ralph-demo");
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected SessionActive, got {:?}", other),
        }

        // Once the first run goes quiet it is a crash and may be taken over
        stale_session(running.sessions());
        assert!(second.detect_crash().expect("detect"));
        assert!(second.live_session().expect("live").is_none());
        second.begin_session().expect("take over");
    }

    #[test]
    fn test_crash_report_flags_stale_heartbeat() {
        let temp_dir = TempDir::new().expect("temp dir");
        let config = CheckpointConfig::default().with_max_idle(Duration::ZERO);
        let recovery = manager(temp_dir.path(), config);
        recovery.begin_session().expect("begin");
        recovery.snapshot(Some("US-001"), 3, json!({})).expect("snapshot");
        std::thread::sleep(Duration::from_millis(5));

        let report = recovery.crash_report().expect("report").expect("crash");
        assert_eq!(report.last_iteration, Some(3));
        assert!(report.idle_exceeded);
        assert!(report.summary().contains("iteration 3"));
    }

    #[test]
    fn test_fresh_start_discards_everything() {
        let temp_dir = TempDir::new().expect("temp dir");
        let recovery = manager(temp_dir.path(), CheckpointConfig::default());
        recovery.begin_session().expect("begin");
        recovery.snapshot(None, 1, json!({})).expect("snapshot");

        recovery.fresh_start().expect("fresh");
        assert!(!recovery.detect_crash().expect("detect"));
        assert_eq!(recovery.resume().expect("resume").iteration, 0);
    }

    #[tokio::test]
    async fn test_non_interactive_resumes_without_asking() {
        let temp_dir = TempDir::new().expect("temp dir");
        let recovery = manager(temp_dir.path(), CheckpointConfig::default());
        let decision = recovery
            .resolve_decision(async { Some(RecoveryDecision::FreshStart) })
            .await;
        assert_eq!(decision, RecoveryDecision::Resume);
    }

    #[tokio::test]
    async fn test_interactive_times_out_to_resume() {
        let temp_dir = TempDir::new().expect("temp dir");
        let config = CheckpointConfig::default()
            .with_interactive(true)
            .with_resume_wait(Duration::from_millis(20));
        let recovery = manager(temp_dir.path(), config);

        let decision = recovery
            .resolve_decision(std::future::pending::<Option<RecoveryDecision>>())
            .await;
        assert_eq!(decision, RecoveryDecision::Resume);

        let decision = recovery
            .resolve_decision(async { Some(RecoveryDecision::FreshStart) })
            .await;
        assert_eq!(decision, RecoveryDecision::FreshStart);
    }

    #[test]
    fn test_cleanup_keeps_configured_count() {
        let temp_dir = TempDir::new().expect("temp dir");
        let config = CheckpointConfig::default().with_keep_checkpoints(2);
        let recovery = manager(temp_dir.path(), config);
        for i in 1..=4 {
            recovery.snapshot(None, i, json!({})).expect("snapshot");
        }
        assert_eq!(recovery.cleanup().expect("cleanup"), 2);
        assert_eq!(recovery.checkpoints().list().expect("list").len(), 2);
    }
}
