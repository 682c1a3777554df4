//! Append-only complexity signal log.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::state_dir;
use crate::error::Result;
use crate::lock::{acquire_best_effort, lock_path_for, LockConfig};
use crate::persist::{append_jsonl, read_jsonl};

const SIGNALS_DIR_NAME: &str = "signals";

/// Signal type with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalKind {
    /// Work on a criterion took longer than `overrun_factor` times its estimate.
    TimeOverrun {
        estimated_secs: u64,
        actual_secs: u64,
    },
    /// A file outside the declared scope was modified.
    ScopeExpansion { path: String },
    Error { message: String },
    /// The agent signalled uncertainty.
    Clarification { question: String },
}

impl SignalKind {
    pub fn label(&self) -> &'static str {
        match self {
            SignalKind::TimeOverrun { .. } => "time_overrun",
            SignalKind::ScopeExpansion { .. } => "scope_expansion",
            SignalKind::Error { .. } => "error",
            SignalKind::Clarification { .. } => "clarification",
        }
    }
}

/// One immutable log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexitySignal {
    pub story_id: String,
    pub timestamp: DateTime<Utc>,
    pub signal: SignalKind,
}

impl ComplexitySignal {
    pub fn new(story_id: impl Into<String>, signal: SignalKind) -> Self {
        Self {
            story_id: story_id.into(),
            timestamp: Utc::now(),
            signal,
        }
    }
}

/// JSONL signal log for one backlog, under a best-effort lock.
#[derive(Debug, Clone)]
pub struct SignalLog {
    path: PathBuf,
    lock_config: LockConfig,
}

impl SignalLog {
    pub fn new(root: &Path, lineage: &str, lock_config: LockConfig) -> Self {
        Self {
            path: state_dir(root)
                .join(SIGNALS_DIR_NAME)
                .join(format!("{}.jsonl", lineage)),
            lock_config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, signal: &ComplexitySignal) -> Result<()> {
        let _guard = acquire_best_effort(&lock_path_for(&self.path), &self.lock_config);
        append_jsonl(&self.path, signal)
    }

    pub fn read_all(&self) -> Result<Vec<ComplexitySignal>> {
        read_jsonl(&self.path)
    }

    /// Signals recorded for one story, oldest first.
    pub fn for_story(&self, story_id: &str) -> Result<Vec<ComplexitySignal>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|s| s.story_id == story_id)
            .collect())
    }
}
