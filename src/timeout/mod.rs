//! Wall-clock bounds for agent and gate calls, and the session heartbeat.
//!
//! The orchestrator never cancels a delegate call mid-flight. These bounds
//! are applied after the fact: a call that ran longer than its limit is
//! recorded as a timeout for that cycle.

pub mod heartbeat;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

pub use heartbeat::SessionHeartbeat;

/// Timeout-related settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Delegate calls running longer than this are accounted as timed out.
    /// Default: 600 seconds (10 minutes)
    #[serde(rename = "agent_timeout_ms", with = "duration_ms")]
    pub agent_timeout: Duration,

    /// Upper bound for a full quality-gate run.
    /// Default: 900 seconds (15 minutes)
    #[serde(rename = "gate_timeout_ms", with = "duration_ms")]
    pub gate_timeout: Duration,

    /// Interval between session heartbeat writes while a cycle runs.
    /// Default: 30 seconds
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Maximum time allowed for individual git commands.
    /// Default: 60 seconds
    #[serde(rename = "git_timeout_ms", with = "duration_ms")]
    pub git_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(600),
            gate_timeout: Duration::from_secs(900),
            heartbeat_interval: Duration::from_secs(30),
            git_timeout: Duration::from_secs(60),
        }
    }
}

impl TimeoutConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_gate_timeout(mut self, timeout: Duration) -> Self {
        self.gate_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    /// Whether a completed call of `elapsed` length exceeded the agent bound.
    pub fn agent_overran(&self, elapsed: Duration) -> bool {
        elapsed > self.agent_timeout
    }
}
