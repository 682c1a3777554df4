//! Autonomous story orchestrator.
//!
//! Drives a backlog of user stories through an implementation agent and
//! quality gates, one story per iteration, with crash-safe checkpoints,
//! isolated parallel workers, complexity-driven story splitting and a
//! queue daemon for backlog submissions.

pub mod agent;
pub mod backlog;
pub mod checkpoint;
pub mod complexity;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod lock;
pub mod logging;
pub mod parallel;
pub mod persist;
pub mod process;
pub mod quality;
pub mod split;
#[cfg(test)]
pub mod testing;
pub mod timeout;
pub mod vcs;

pub use error::{RalphError, Result};
