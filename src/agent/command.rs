//! Agent backed by an external command.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{AgentReport, AgentTask, ImplementationAgent};
use crate::error::{RalphError, Result};
use crate::process::run_shell;

/// Environment handed to the agent command.
pub const ENV_STORY_ID: &str = "RALPH_STORY_ID";
pub const ENV_BACKLOG: &str = "RALPH_BACKLOG";
pub const ENV_ITERATION: &str = "RALPH_ITERATION";

/// Marker the agent prints when it believes the backlog is finished.
const ALL_COMPLETE_MARKER: &str = "<promise>COMPLETE</promise>";
/// Lines of output kept as the report's notes.
const NOTES_TAIL_LINES: usize = 20;

/// Command line used to invoke the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCommandConfig {
    /// Shell command; the prompt is written to its stdin.
    pub command: String,
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            command: "claude --print".to_string(),
        }
    }
}

impl AgentCommandConfig {
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }
}

/// Runs the configured command inside the task's workspace.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    config: AgentCommandConfig,
}

impl CommandAgent {
    pub fn new(config: AgentCommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ImplementationAgent for CommandAgent {
    async fn attempt(&self, task: &AgentTask) -> Result<AgentReport> {
        info!(
            story_id = %task.story_id,
            iteration = task.iteration,
            command = %self.config.command,
            "delegating to agent"
        );
        let prompt = task.render_prompt();
        let backlog = task.backlog_path.to_string_lossy();
        let iteration = task.iteration.to_string();
        let envs = [
            (ENV_STORY_ID, task.story_id.as_str()),
            (ENV_BACKLOG, backlog.as_ref()),
            (ENV_ITERATION, iteration.as_str()),
        ];
        // No timeout here: an overrun is accounted after the call returns
        let output = run_shell(
            &self.config.command,
            &task.workspace,
            &envs,
            Some(prompt.as_bytes()),
            None,
        )
        .await
        .map_err(|e| RalphError::Agent {
            story_id: task.story_id.clone(),
            message: format!("failed to spawn '{}': {}", self.config.command, e),
        })?;

        if !output.success {
            warn!(story_id = %task.story_id, code = ?output.code, "agent exited with failure");
            return Err(RalphError::Agent {
                story_id: task.story_id.clone(),
                message: format!(
                    "exit status {:?}: {}",
                    output.code,
                    output.tail(NOTES_TAIL_LINES)
                ),
            });
        }

        let report = parse_report(&output.stdout);
        debug!(
            story_id = %task.story_id,
            errors = report.errors.len(),
            clarifications = report.clarifications.len(),
            modified = report.modified_files.len(),
            "agent finished"
        );
        Ok(report)
    }
}

fn trailer_regex() -> &'static Regex {
    static TRAILER: OnceLock<Regex> = OnceLock::new();
    TRAILER.get_or_init(|| {
        Regex::new(r"^\s*RALPH:(CLARIFY|ERROR|CRITERIA_MET|MODIFIED)\b\s*(.*)$")
            .expect("trailer regex is valid")
    })
}

/// Build a report from agent stdout. Trailer lines are parsed out; the
/// remaining tail becomes the notes.
pub fn parse_report(stdout: &str) -> AgentReport {
    let mut report = AgentReport {
        completed: true,
        ..Default::default()
    };
    let mut plain = Vec::new();

    for line in stdout.lines() {
        if line.contains(ALL_COMPLETE_MARKER) {
            report.claims_all_complete = true;
            continue;
        }
        let Some(caps) = trailer_regex().captures(line) else {
            plain.push(line);
            continue;
        };
        let value = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
        match &caps[1] {
            "CLARIFY" => report.clarifications.push(value.to_string()),
            "ERROR" => report.errors.push(value.to_string()),
            "MODIFIED" if !value.is_empty() => report.modified_files.push(value.to_string()),
            "CRITERIA_MET" => match value.parse::<u32>() {
                Ok(n) => report.criteria_met = Some(n),
                Err(_) => debug!(value, "ignoring malformed CRITERIA_MET trailer"),
            },
            _ => {}
        }
    }

    let start = plain.len().saturating_sub(NOTES_TAIL_LINES);
    report.notes = plain[start..].join("\n").trim().to_string();
    report
}
