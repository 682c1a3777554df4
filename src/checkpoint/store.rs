//! Append-only checkpoint stream.
//!
//! One file per checkpoint, named by zero-padded iteration, under
//! `.ralph/checkpoints/<lineage>/`. Each file is written with
//! write-then-rename, so a crash mid-write leaves only a stray `.tmp` that
//! readers ignore.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::state_dir;
use crate::error::{RalphError, Result};
use crate::persist::{read_json, write_json_atomic};

const CHECKPOINTS_DIR_NAME: &str = "checkpoints";
const CHECKPOINT_PREFIX: &str = "checkpoint-";
const CHECKPOINT_SUFFIX: &str = ".json";

/// Current checkpoint schema version.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Immutable snapshot of run progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub backlog_id: String,
    pub lineage: String,
    pub iteration: u32,
    /// Story worked in the cycle that produced this checkpoint.
    pub story_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Arbitrary caller context (last outcome, complexity score, ...).
    #[serde(default)]
    pub context: Value,
}

impl Checkpoint {
    pub fn new(
        backlog_id: impl Into<String>,
        lineage: impl Into<String>,
        iteration: u32,
        story_id: Option<String>,
        context: Value,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            backlog_id: backlog_id.into(),
            lineage: lineage.into(),
            iteration,
            story_id,
            created_at: Utc::now(),
            context,
        }
    }

    /// Age relative to now.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Handle to a written checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRef {
    pub iteration: u32,
    pub path: PathBuf,
}

/// Checkpoint stream for one lineage.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: &Path, lineage: &str) -> Self {
        Self {
            dir: state_dir(root).join(CHECKPOINTS_DIR_NAME).join(lineage),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a checkpoint. Iterations must strictly increase.
    pub fn append(&self, checkpoint: &Checkpoint) -> Result<CheckpointRef> {
        if let Some(latest) = self.iterations()?.last().copied() {
            if checkpoint.iteration <= latest {
                return Err(RalphError::CheckpointOrder {
                    latest,
                    attempted: checkpoint.iteration,
                });
            }
        }
        let path = self.path_for(checkpoint.iteration);
        write_json_atomic(&path, checkpoint)?;
        Ok(CheckpointRef {
            iteration: checkpoint.iteration,
            path,
        })
    }

    /// The checkpoint with the highest iteration, if any.
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        match self.iterations()?.last() {
            Some(iteration) => read_json(&self.path_for(*iteration)),
            None => Ok(None),
        }
    }

    /// All checkpoints in iteration order.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for iteration in self.iterations()? {
            if let Some(checkpoint) = read_json(&self.path_for(iteration))? {
                checkpoints.push(checkpoint);
            }
        }
        Ok(checkpoints)
    }

    /// Delete all but the newest `keep` checkpoints. Returns how many were removed.
    pub fn prune(&self, keep: usize) -> Result<usize> {
        let iterations = self.iterations()?;
        let excess = iterations.len().saturating_sub(keep);
        for iteration in &iterations[..excess] {
            fs::remove_file(self.path_for(*iteration))?;
        }
        Ok(excess)
    }

    /// Delete the whole stream.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn path_for(&self, iteration: u32) -> PathBuf {
        self.dir.join(format!(
            "{}{:08}{}",
            CHECKPOINT_PREFIX, iteration, CHECKPOINT_SUFFIX
        ))
    }

    /// Sorted iterations of completed checkpoint files.
    fn iterations(&self) -> Result<Vec<u32>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut iterations = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            let parsed = name
                .strip_prefix(CHECKPOINT_PREFIX)
                .and_then(|rest| rest.strip_suffix(CHECKPOINT_SUFFIX))
                .and_then(|digits| digits.parse::<u32>().ok());
            if let Some(iteration) = parsed {
                iterations.push(iteration);
            }
        }
        iterations.sort_unstable();
        Ok(iterations)
    }
}
