//! Error types for the orchestrator.
//!
//! Library code returns [`RalphError`]; callers use [`RalphError::classify`]
//! to tell transient failures (retried by the iteration loop) apart from
//! structural ones (surfaced to the operator).

pub mod classification;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use classification::ErrorCategory;

/// Structural problems with a backlog document or a proposed mutation of it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BacklogError {
    /// Two stories share the same id.
    #[error("duplicate story id '{0}'")]
    DuplicateId(String),

    /// A story depends on an id that is not in the backlog.
    #[error("story '{story_id}' depends on unknown story '{dependency}'")]
    UnknownDependency { story_id: String, dependency: String },

    /// The dependency graph contains a cycle through the given story.
    #[error("dependency cycle detected involving story '{0}'")]
    DependencyCycle(String),

    /// A lookup referenced a story that does not exist.
    #[error("story '{0}' not found")]
    UnknownStory(String),

    /// A story id is empty or whitespace.
    #[error("story at position {0} has an empty id")]
    EmptyId(usize),
}

/// Errors raised by file locking.
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock could not be acquired within the configured wait.
    #[error("timed out acquiring lock {path} after {waited_ms}ms")]
    Timeout { path: PathBuf, waited_ms: u64 },

    /// IO error while opening or locking the lock file.
    #[error("lock IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Top-level error type.
#[derive(Error, Debug)]
pub enum RalphError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("backlog error: {0}")]
    Backlog(#[from] BacklogError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// The implementation agent call failed.
    #[error("agent failed on story {story_id}: {message}")]
    Agent { story_id: String, message: String },

    /// A delegate or gate call exceeded its wall-clock bound.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// The quality-gate runner itself could not run.
    #[error("quality gate runner failed: {0}")]
    Gate(String),

    /// Version-control operation failed.
    #[error("vcs error: {0}")]
    Vcs(String),

    /// No eligible story exists while incomplete stories remain.
    #[error("dependency deadlock: no eligible story among incomplete {incomplete:?}")]
    Deadlock { incomplete: Vec<String> },

    /// No split proposal with the given id.
    #[error("split proposal '{0}' not found")]
    UnknownProposal(String),

    /// A proposal was asked to move into a state its current state forbids.
    #[error("split proposal '{id}' cannot be {action}: status is {status}")]
    ProposalState {
        id: String,
        action: String,
        status: String,
    },

    /// A proposal or edit violates the 2-5 sub-story bound or similar.
    #[error("invalid split proposal: {0}")]
    InvalidProposal(String),

    /// No checkpoint to resume from.
    #[error("no checkpoint available for {0}")]
    NoCheckpoint(String),

    /// Checkpoint iterations must strictly increase.
    #[error("checkpoint iteration {attempted} is not after latest {latest}")]
    CheckpointOrder { latest: u32, attempted: u32 },

    /// Another process is still running this backlog lineage.
    #[error("{lineage} is already being run by pid {pid} (last heartbeat {heartbeat_secs}s ago)")]
    SessionActive {
        lineage: String,
        pid: u32,
        heartbeat_secs: u64,
    },

    /// Another daemon instance is heartbeating on the same queue.
    #[error("daemon already running (instance {instance}, pid {pid})")]
    DaemonAlreadyRunning { instance: String, pid: u32 },

    /// Daemon task lookup failed.
    #[error("task '{0}' not found in queue")]
    UnknownTask(String),

    /// Every worker slot is taken; try again once one frees up.
    #[error("all {0} worker slots are busy")]
    CoordinatorFull(usize),

    /// Worker registry lookup failed.
    #[error("worker '{0}' not registered")]
    UnknownWorker(String),
}

impl RalphError {
    /// Classify this error for retry decisions.
    pub fn classify(&self) -> ErrorCategory {
        match self {
            RalphError::Io(e) => ErrorCategory::Transient(e.to_string()),
            RalphError::Agent { message, .. } => ErrorCategory::Transient(message.clone()),
            RalphError::Gate(msg) => ErrorCategory::Transient(msg.clone()),
            RalphError::Vcs(msg) => ErrorCategory::Transient(msg.clone()),
            RalphError::Lock(LockError::Timeout { .. }) => {
                ErrorCategory::Transient(self.to_string())
            }
            RalphError::CoordinatorFull(_) => ErrorCategory::Transient(self.to_string()),
            RalphError::Timeout { .. } => ErrorCategory::Timeout(self.to_string()),
            other => ErrorCategory::Fatal(other.to_string()),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RalphError>;
