//! Runtime complexity monitoring.
//!
//! Four signals (time overrun, scope expansion, error bursts, clarification
//! requests) are appended to a per-backlog log as they happen and folded into
//! a 0-10 score for the active story.

pub mod monitor;
pub mod signals;

use serde::{Deserialize, Serialize};

use crate::backlog::{ComplexityTier, Story};

pub use monitor::{score_signals, AttemptObservation, ComplexityMonitor, ComplexityScore};
pub use signals::{ComplexitySignal, SignalKind, SignalLog};

/// Weight of the time-overrun signal.
pub const TIME_WEIGHT: f64 = 0.35;
/// Weight of the scope-expansion signal.
pub const SCOPE_WEIGHT: f64 = 0.25;
/// Weight of the error-count signal.
pub const ERROR_WEIGHT: f64 = 0.25;
/// Weight of the clarification signal.
pub const CLARIFICATION_WEIGHT: f64 = 0.15;
/// Upper bound of every normalized signal and of the score.
pub const MAX_SCORE: f64 = 10.0;

/// Scoring thresholds and per-criterion estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityConfig {
    /// Score at or above which a split is proposed (0-10)
    pub threshold: f64,
    /// Actual/estimate ratio beyond which a criterion counts as overrun
    pub overrun_factor: f64,
    /// Errors tolerated before the error signal contributes
    pub error_threshold: u32,
    /// Minutes per acceptance criterion for small stories
    pub small_criterion_minutes: u32,
    /// Minutes per acceptance criterion for medium stories
    pub medium_criterion_minutes: u32,
    /// Minutes per acceptance criterion for large stories
    pub large_criterion_minutes: u32,
}

impl Default for ComplexityConfig {
    fn default() -> Self {
        Self {
            threshold: 7.0,
            overrun_factor: 2.0,
            error_threshold: 3,
            small_criterion_minutes: 10,
            medium_criterion_minutes: 20,
            large_criterion_minutes: 40,
        }
    }
}

impl ComplexityConfig {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_overrun_factor(mut self, factor: f64) -> Self {
        self.overrun_factor = factor;
        self
    }

    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }

    /// Estimated minutes for one acceptance criterion of `story`.
    ///
    /// An explicit `estimatedMinutes` is spread across the criteria;
    /// otherwise the tier default applies. Never below one minute.
    pub fn criterion_estimate_minutes(&self, story: &Story) -> f64 {
        let minutes = match story.estimated_minutes {
            Some(total) => total as f64 / story.acceptance_criteria.len().max(1) as f64,
            None => match story.complexity {
                ComplexityTier::Small => self.small_criterion_minutes as f64,
                ComplexityTier::Medium => self.medium_criterion_minutes as f64,
                ComplexityTier::Large => self.large_criterion_minutes as f64,
            },
        };
        minutes.max(1.0)
    }
}
