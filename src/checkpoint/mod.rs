//! Checkpoint stream, session record and crash recovery.

pub mod recovery;
pub mod session;
pub mod store;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

pub use recovery::{CrashReport, RecoveryDecision, RecoveryManager, ResumePoint};
pub use session::{Session, SessionStore};
pub use store::{Checkpoint, CheckpointRef, CheckpointStore, CHECKPOINT_SCHEMA_VERSION};

/// Crash-detection and resume settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Heartbeat silence beyond this marks a crashed run as idle.
    #[serde(rename = "max_idle_ms", with = "duration_ms")]
    pub max_idle: Duration,
    /// How long an interactive crash prompt waits before resuming.
    #[serde(rename = "resume_wait_ms", with = "duration_ms")]
    pub resume_wait: Duration,
    /// Ask the operator after a crash. Off means auto-resume.
    pub interactive: bool,
    /// Checkpoints retained by an explicit cleanup.
    pub keep_checkpoints: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(15 * 60),
            resume_wait: Duration::from_secs(30),
            interactive: false,
            keep_checkpoints: 20,
        }
    }
}

impl CheckpointConfig {
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_resume_wait(mut self, wait: Duration) -> Self {
        self.resume_wait = wait;
        self
    }

    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_keep_checkpoints(mut self, keep: usize) -> Self {
        self.keep_checkpoints = keep;
        self
    }
}
