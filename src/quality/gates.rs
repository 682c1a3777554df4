//! Command-driven quality gates.
//!
//! Each configured gate is a shell command run in the worker's workspace.
//! A failing blocking gate reverts the story; a failing non-blocking gate
//! is only reported as a warning.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{GateLevel, GateReport, QualityGateRunner};
use crate::error::Result;
use crate::process::run_shell;

/// Lines of gate output kept in a failing result.
const DETAIL_TAIL_LINES: usize = 20;

/// Category of a gate, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Unit or integration tests
    Test,
    /// Compilation or type checking
    TypeCheck,
    /// Linting
    Lint,
    /// Dependency or code security scanning
    Security,
    /// Anything else
    Other,
}

impl FailureCategory {
    /// Guess the category from a gate name.
    pub fn for_gate(name: &str) -> Self {
        match name {
            "tests" | "test" => FailureCategory::Test,
            "types" | "typecheck" | "check" => FailureCategory::TypeCheck,
            "lint" | "clippy" => FailureCategory::Lint,
            "security" | "audit" => FailureCategory::Security,
            _ => FailureCategory::Other,
        }
    }
}

/// One configured gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSpec {
    pub name: String,
    pub command: String,
    /// A failure reverts the story when set.
    #[serde(default = "default_blocking")]
    pub blocking: bool,
    /// Lowest level at which the gate runs.
    #[serde(default)]
    pub level: GateLevel,
}

fn default_blocking() -> bool {
    true
}

impl GateSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>, level: GateLevel) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            blocking: true,
            level,
        }
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }
}

/// Gate commands for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateCommandConfig {
    pub gates: Vec<GateSpec>,
}

impl Default for GateCommandConfig {
    fn default() -> Self {
        Self {
            gates: vec![
                GateSpec::new("tests", "cargo test", GateLevel::Minimal),
                GateSpec::new("types", "cargo check --all-targets", GateLevel::Standard),
                GateSpec::new("lint", "cargo clippy -- -D warnings", GateLevel::Standard)
                    .non_blocking(),
                GateSpec::new("security", "cargo audit", GateLevel::Strict),
            ],
        }
    }
}

impl GateCommandConfig {
    pub fn with_gates(mut self, gates: Vec<GateSpec>) -> Self {
        self.gates = gates;
        self
    }

    /// Gates that run at `level`, in configured order.
    pub fn selected(&self, level: GateLevel) -> impl Iterator<Item = &GateSpec> {
        self.gates.iter().filter(move |g| g.level <= level)
    }
}

/// The result of running a single quality gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    /// Name of the quality gate that was run
    pub gate_name: String,
    pub category: FailureCategory,
    /// Whether the gate passed
    pub passed: bool,
    pub blocking: bool,
    /// Human-readable message describing the result
    pub message: String,
    /// Tail of the gate's output on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub duration_ms: u64,
}

impl GateResult {
    /// Create a new passing gate result.
    pub fn pass(spec: &GateSpec, duration: Duration) -> Self {
        Self {
            gate_name: spec.name.clone(),
            category: FailureCategory::for_gate(&spec.name),
            passed: true,
            blocking: spec.blocking,
            message: format!("{} passed", spec.name),
            details: None,
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create a new failing gate result.
    pub fn fail(
        spec: &GateSpec,
        message: impl Into<String>,
        details: Option<String>,
        duration: Duration,
    ) -> Self {
        Self {
            gate_name: spec.name.clone(),
            category: FailureCategory::for_gate(&spec.name),
            passed: false,
            blocking: spec.blocking,
            message: message.into(),
            details,
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// One-line description used in reports and story notes.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.gate_name, self.message)
    }
}

/// Get a summary of gate results.
pub fn summary(results: &[GateResult]) -> String {
    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();
    let failed: Vec<&str> = results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.gate_name.as_str())
        .collect();

    if failed.is_empty() {
        format!("All {total} gates passed")
    } else {
        format!(
            "{passed}/{total} gates passed. Failed: {}",
            failed.join(", ")
        )
    }
}

/// Runs [`GateCommandConfig`] gates as shell commands.
#[derive(Debug, Clone)]
pub struct CommandGateRunner {
    config: GateCommandConfig,
    /// Hard bound per gate; a gate that exceeds it fails.
    timeout: Duration,
}

impl CommandGateRunner {
    pub fn new(config: GateCommandConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    async fn run_gate(&self, spec: &GateSpec, workspace: &Path) -> GateResult {
        debug!(gate = %spec.name, command = %spec.command, "running gate");
        let start = Instant::now();
        let output = run_shell(&spec.command, workspace, &[], None, Some(self.timeout)).await;
        let duration = start.elapsed();

        match output {
            Ok(output) if output.timed_out => GateResult::fail(
                spec,
                format!("timed out after {}s", self.timeout.as_secs()),
                None,
                duration,
            ),
            Ok(output) if output.success => GateResult::pass(spec, duration),
            Ok(output) => GateResult::fail(
                spec,
                format!("`{}` exited with {:?}", spec.command, output.code),
                Some(output.tail(DETAIL_TAIL_LINES)),
                duration,
            ),
            Err(e) => GateResult::fail(
                spec,
                format!("failed to run `{}`", spec.command),
                Some(format!("Error: {}", e)),
                duration,
            ),
        }
    }
}

#[async_trait]
impl QualityGateRunner for CommandGateRunner {
    async fn run(&self, workspace: &Path, level: GateLevel) -> Result<GateReport> {
        let mut results = Vec::new();
        for spec in self.config.selected(level) {
            let result = self.run_gate(spec, workspace).await;
            if result.passed {
                debug!(gate = %result.gate_name, duration_ms = result.duration_ms, "gate passed");
            } else {
                warn!(
                    gate = %result.gate_name,
                    blocking = result.blocking,
                    message = %result.message,
                    "gate failed"
                );
            }
            results.push(result);
        }
        info!(level = %level, summary = %summary(&results), "quality gates finished");
        Ok(GateReport::from_results(results))
    }
}
