//! Implementation agent interface.
//!
//! The engine never trusts what an agent says about completion. It only
//! reads the backlog's `passes` flag after the call returns; the report
//! feeds the complexity monitor and the audit log.

pub mod command;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backlog::Story;
use crate::error::Result;

pub use command::{parse_report, AgentCommandConfig, CommandAgent};

/// What the agent is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentTask {
    pub story_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub file_scope: Vec<String>,
    /// Notes accumulated on the story (earlier gate failures etc.).
    pub notes: String,
    pub iteration: u32,
    /// Isolated working copy the agent operates in.
    pub workspace: PathBuf,
    /// Backlog document the agent marks `passes` in.
    pub backlog_path: PathBuf,
}

impl AgentTask {
    pub fn from_story(
        story: &Story,
        iteration: u32,
        workspace: impl Into<PathBuf>,
        backlog_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            story_id: story.id.clone(),
            title: story.title.clone(),
            description: story.description.clone(),
            acceptance_criteria: story.acceptance_criteria.clone(),
            file_scope: story.target_files.clone(),
            notes: story.notes.clone(),
            iteration,
            workspace: workspace.into(),
            backlog_path: backlog_path.into(),
        }
    }

    /// Prompt handed to a command agent on stdin.
    pub fn render_prompt(&self) -> String {
        let mut prompt = format!("# Story {}: {}\n\n", self.story_id, self.title);
        if !self.description.is_empty() {
            prompt.push_str(&self.description);
            prompt.push_str("\n\n");
        }
        prompt.push_str("## Acceptance criteria\n");
        for (i, criterion) in self.acceptance_criteria.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, criterion));
        }
        if !self.file_scope.is_empty() {
            prompt.push_str("\n## Allowed files\n");
            for glob in &self.file_scope {
                prompt.push_str(&format!("- {}\n", glob));
            }
        }
        if !self.notes.is_empty() {
            prompt.push_str("\n## Notes from earlier attempts\n");
            prompt.push_str(&self.notes);
            prompt.push('\n');
        }
        prompt.push_str(&format!(
            "\n## Protocol\n\
             When every criterion is met and checks pass, set \"passes\": true for {} in {}.\n\
             Report on their own lines:\n\
             RALPH:CRITERIA_MET <n>   criteria finished in this attempt\n\
             RALPH:MODIFIED <path>    each file you changed\n\
             RALPH:ERROR <text>       each error you hit\n\
             RALPH:CLARIFY <text>     anything you were unsure about\n",
            self.story_id,
            self.backlog_path.display()
        ));
        prompt
    }
}

/// What came back from one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    /// The call itself finished normally. Says nothing about the story.
    pub completed: bool,
    pub notes: String,
    pub criteria_met: Option<u32>,
    pub modified_files: Vec<String>,
    pub errors: Vec<String>,
    pub clarifications: Vec<String>,
    /// The agent claims the whole backlog is done.
    pub claims_all_complete: bool,
}

/// Opaque, possibly slow, possibly failing implementation capability.
#[async_trait]
pub trait ImplementationAgent: Send + Sync {
    async fn attempt(&self, task: &AgentTask) -> Result<AgentReport>;
}
