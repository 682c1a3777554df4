//! Engine states, per-cycle outcomes and the final run report.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::exit_codes;

/// Position of the engine in its state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    SelectStory,
    Delegate { story_id: String },
    Validate { story_id: String },
    Complete { story_id: String },
    Retry { story_id: String, reason: String },
    Blocked { story_id: String, reason: String },
    AllStoriesComplete,
    BudgetExhausted,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineState::AllStoriesComplete | EngineState::BudgetExhausted
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            EngineState::SelectStory => "select_story",
            EngineState::Delegate { .. } => "delegate",
            EngineState::Validate { .. } => "validate",
            EngineState::Complete { .. } => "complete",
            EngineState::Retry { .. } => "retry",
            EngineState::Blocked { .. } => "blocked",
            EngineState::AllStoriesComplete => "all_stories_complete",
            EngineState::BudgetExhausted => "budget_exhausted",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a single cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Complete,
    Retry,
    Blocked,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleOutcome::Complete => "complete",
            CycleOutcome::Retry => "retry",
            CycleOutcome::Blocked => "blocked",
        };
        f.write_str(name)
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    AllStoriesComplete,
    BudgetExhausted,
    /// Open stories remain but none has its dependencies met.
    Deadlock { incomplete: Vec<String> },
    /// An approved split could not be applied; the backlog is unchanged.
    SplitFailed {
        story_id: String,
        proposal_id: String,
        message: String,
    },
    /// Cancellation was requested between iterations.
    Cancelled,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::AllStoriesComplete => exit_codes::SUCCESS,
            RunOutcome::BudgetExhausted | RunOutcome::Cancelled => exit_codes::PARTIAL,
            RunOutcome::Deadlock { .. } | RunOutcome::SplitFailed { .. } => exit_codes::FAILURE,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::AllStoriesComplete)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::AllStoriesComplete => write!(f, "all stories complete"),
            RunOutcome::BudgetExhausted => write!(f, "iteration budget exhausted"),
            RunOutcome::Deadlock { incomplete } => write!(
                f,
                "dependency deadlock: no eligible story among {}",
                incomplete.join(", ")
            ),
            RunOutcome::SplitFailed {
                story_id,
                proposal_id,
                message,
            } => write!(
                f,
                "split {} of story {} could not be applied: {}",
                proposal_id, story_id, message
            ),
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Summary of one engine run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub project: String,
    pub lineage: String,
    pub outcome: RunOutcome,
    /// Cycles spent in this run.
    pub iterations_run: u32,
    /// Iteration counter of the last checkpoint written.
    pub last_iteration: u32,
    pub completed: Vec<String>,
    /// Story id and reason for every blocked cycle.
    pub blocked: Vec<(String, String)>,
    /// Proposal ids created during the run.
    pub proposals: Vec<String>,
    /// Open story ids when the run stopped.
    pub remaining: Vec<String>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}
