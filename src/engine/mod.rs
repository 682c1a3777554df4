//! Iteration engine: drives one backlog to completion or budget exhaustion.
//!
//! Each cycle walks `SelectStory -> Delegate -> Validate` and ends in one of
//! `Complete`, `Retry` or `Blocked`. The loop stops at `AllStoriesComplete`,
//! `BudgetExhausted`, a dependency deadlock, a failed split mutation, or a
//! cancellation request observed between iterations.

pub mod audit;
pub mod runner;
pub mod state;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::ImplementationAgent;
use crate::quality::{GateLevel, QualityGateRunner};
use crate::split::SplitApprover;
use crate::vcs::VersionControl;

pub use audit::{AuditLog, AuditRecord};
pub use runner::IterationEngine;
pub use state::{CycleOutcome, EngineState, RunOutcome, RunReport};

/// Default number of cycles one run may spend.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cycles allowed per run before `BudgetExhausted`.
    pub max_iterations: u32,
    /// Which quality gates run during validation.
    pub gate_level: GateLevel,
    /// Backlog document, relative to the project root.
    pub backlog_file: String,
    /// Approve split proposals without asking.
    pub auto_split: bool,
    /// Snapshot the workspace after every completed story.
    pub snapshot_on_complete: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            gate_level: GateLevel::Standard,
            backlog_file: "prd.json".to_string(),
            auto_split: false,
            snapshot_on_complete: true,
        }
    }
}

impl EngineConfig {
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_gate_level(mut self, level: GateLevel) -> Self {
        self.gate_level = level;
        self
    }

    pub fn with_backlog_file(mut self, file: impl Into<String>) -> Self {
        self.backlog_file = file.into();
        self
    }

    pub fn with_auto_split(mut self, auto_split: bool) -> Self {
        self.auto_split = auto_split;
        self
    }

    pub fn with_snapshot_on_complete(mut self, snapshot: bool) -> Self {
        self.snapshot_on_complete = snapshot;
        self
    }
}

/// The three external capabilities plus the split approver, shared by every
/// engine a coordinator or daemon starts.
#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn ImplementationAgent>,
    pub gates: Arc<dyn QualityGateRunner>,
    pub vcs: Arc<dyn VersionControl>,
    pub approver: Arc<dyn SplitApprover>,
}

impl Collaborators {
    pub fn new(
        agent: Arc<dyn ImplementationAgent>,
        gates: Arc<dyn QualityGateRunner>,
        vcs: Arc<dyn VersionControl>,
        approver: Arc<dyn SplitApprover>,
    ) -> Self {
        Self {
            agent,
            gates,
            vcs,
            approver,
        }
    }

    pub fn with_approver(mut self, approver: Arc<dyn SplitApprover>) -> Self {
        self.approver = approver;
        self
    }

    pub fn with_vcs(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = vcs;
        self
    }
}
