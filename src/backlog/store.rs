//! Durable backlog document.
//!
//! The backlog has a single writer at a time. Every write takes the strict
//! advisory lock, re-reads the document, applies the mutation to a copy,
//! re-validates the structure and only then replaces the file atomically.
//! A failed mutation leaves the previous document untouched.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};

use crate::backlog::story::{sanitize_component, Backlog};
use crate::backlog::validate::validate_backlog;
use crate::error::{BacklogError, RalphError, Result};
use crate::lock::{acquire_strict, lock_path_for, LockConfig};
use crate::persist::write_json_atomic;

/// Default backlog file name in a project root.
pub const DEFAULT_BACKLOG_FILE: &str = "prd.json";

/// File-backed backlog with strict locking.
#[derive(Debug, Clone)]
pub struct BacklogStore {
    path: PathBuf,
    lock_config: LockConfig,
}

impl BacklogStore {
    pub fn new(path: impl Into<PathBuf>, lock_config: LockConfig) -> Self {
        Self {
            path: path.into(),
            lock_config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the current document.
    pub fn load(&self) -> Result<Backlog> {
        let content = fs::read_to_string(&self.path)?;
        let backlog: Backlog = serde_json::from_str(&content)?;
        Ok(backlog)
    }

    /// Read, parse and structurally validate the current document.
    pub fn load_validated(&self) -> Result<Backlog> {
        let backlog = self.load()?;
        validate_backlog(&backlog)?;
        Ok(backlog)
    }

    /// Replace the whole document.
    pub fn save(&self, backlog: &Backlog) -> Result<()> {
        validate_backlog(backlog)?;
        let _guard = acquire_strict(&lock_path_for(&self.path), &self.lock_config)?;
        write_json_atomic(&self.path, backlog)
    }

    /// Apply `mutate` under exclusive access and commit only if the closure
    /// succeeds and the result is structurally valid.
    pub fn update<T, F>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut Backlog) -> Result<T>,
    {
        let _guard = acquire_strict(&lock_path_for(&self.path), &self.lock_config)?;
        let mut working = self.load()?;
        let value = mutate(&mut working)?;
        validate_backlog(&working)?;
        write_json_atomic(&self.path, &working)?;
        debug!(path = %self.path.display(), "backlog committed");
        Ok(value)
    }

    /// Set the completion flag of one story.
    pub fn set_passes(&self, story_id: &str, passes: bool) -> Result<()> {
        self.update(|backlog| {
            let story = backlog
                .story_mut(story_id)
                .ok_or_else(|| BacklogError::UnknownStory(story_id.to_string()))?;
            story.passes = passes;
            Ok(())
        })
    }

    /// Append a line to a story's notes.
    pub fn append_note(&self, story_id: &str, note: &str) -> Result<()> {
        self.update(|backlog| {
            let story = backlog
                .story_mut(story_id)
                .ok_or_else(|| BacklogError::UnknownStory(story_id.to_string()))?;
            story.append_note(note);
            Ok(())
        })
    }

    /// Re-read a single story's completion flag.
    pub fn story_passes(&self, story_id: &str) -> Result<bool> {
        let backlog = self.load()?;
        backlog
            .story(story_id)
            .map(|s| s.passes)
            .ok_or_else(|| RalphError::Backlog(BacklogError::UnknownStory(story_id.to_string())))
    }

    /// Copy the document into `archive_root/<date>-<branch>/`. The live
    /// document is left in place; backlogs are never deleted.
    pub fn archive(&self, archive_root: &Path) -> Result<PathBuf> {
        let backlog = self.load()?;
        let folder = format!(
            "{}-{}",
            Utc::now().format("%Y-%m-%d"),
            sanitize_component(&backlog.branch_name)
        );
        let dir = archive_root.join(folder);
        fs::create_dir_all(&dir)?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| DEFAULT_BACKLOG_FILE.into());
        let target = dir.join(file_name);
        write_json_atomic(&target, &backlog)?;
        info!(archive = %target.display(), "backlog archived");
        Ok(target)
    }
}
