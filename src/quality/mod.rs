//! Quality-gate runner interface.

pub mod gates;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use gates::{
    summary, CommandGateRunner, FailureCategory, GateCommandConfig, GateResult, GateSpec,
};

/// How thorough a gate run is. Each level includes the ones below it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum GateLevel {
    Minimal,
    #[default]
    Standard,
    Strict,
}

impl fmt::Display for GateLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GateLevel::Minimal => "minimal",
            GateLevel::Standard => "standard",
            GateLevel::Strict => "strict",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for GateLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(GateLevel::Minimal),
            "standard" => Ok(GateLevel::Standard),
            "strict" => Ok(GateLevel::Strict),
            other => Err(format!("unknown gate level '{}'", other)),
        }
    }
}

/// Outcome of one gate run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub all_passed: bool,
    /// Failures that revert the story.
    pub blocking_failures: Vec<String>,
    /// Failures of non-blocking gates.
    pub warnings: Vec<String>,
    #[serde(default)]
    pub results: Vec<GateResult>,
}

impl GateReport {
    pub fn from_results(results: Vec<GateResult>) -> Self {
        let mut blocking_failures = Vec::new();
        let mut warnings = Vec::new();
        for result in results.iter().filter(|r| !r.passed) {
            if result.blocking {
                blocking_failures.push(result.describe());
            } else {
                warnings.push(result.describe());
            }
        }
        Self {
            all_passed: blocking_failures.is_empty() && warnings.is_empty(),
            blocking_failures,
            warnings,
            results,
        }
    }

    /// Report with no gates run.
    pub fn passed() -> Self {
        Self {
            all_passed: true,
            ..Default::default()
        }
    }

    pub fn is_blocked(&self) -> bool {
        !self.blocking_failures.is_empty()
    }
}

/// Executes project checks in a workspace.
#[async_trait]
pub trait QualityGateRunner: Send + Sync {
    async fn run(&self, workspace: &Path, level: GateLevel) -> Result<GateReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering_and_parsing() {
        assert!(GateLevel::Minimal < GateLevel::Standard);
        assert!(GateLevel::Standard < GateLevel::Strict);
        assert_eq!("STRICT".parse::<GateLevel>(), Ok(GateLevel::Strict));
        assert!("pedantic".parse::<GateLevel>().is_err());
        assert_eq!(GateLevel::default().to_string(), "standard");
    }

    #[test]
    fn test_passed_report_is_not_blocked() {
        let report = GateReport::passed();
        assert!(report.all_passed);
        assert!(!report.is_blocked());
    }
}
