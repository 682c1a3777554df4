//! Per-cycle audit/learning log, one JSONL file per backlog lineage.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::state_dir;
use crate::engine::state::CycleOutcome;
use crate::error::Result;
use crate::lock::{acquire_best_effort, lock_path_for, LockConfig};
use crate::persist::{append_jsonl, read_jsonl};

/// One cycle of one story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    pub story_id: String,
    pub outcome: CycleOutcome,
    #[serde(default)]
    pub agent_notes: String,
    #[serde(default)]
    pub gate_failures: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    /// Complexity score after the cycle's signals were recorded.
    pub complexity_score: f64,
    /// The delegate call ran past the agent timeout.
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Append-only audit log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    lock_config: LockConfig,
}

impl AuditLog {
    pub fn new(root: &Path, lineage: &str, lock_config: LockConfig) -> Self {
        Self {
            path: state_dir(root)
                .join("audit")
                .join(format!("{}.jsonl", lineage)),
            lock_config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        let _guard = acquire_best_effort(&lock_path_for(&self.path), &self.lock_config);
        append_jsonl(&self.path, record)
    }

    pub fn read_all(&self) -> Result<Vec<AuditRecord>> {
        read_jsonl(&self.path)
    }
}
