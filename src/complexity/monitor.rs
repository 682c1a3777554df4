//! Weighted complexity scoring for the active story.

use std::collections::HashSet;
use std::time::Duration;

use glob::{MatchOptions, Pattern};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::signals::{ComplexitySignal, SignalKind, SignalLog};
use super::{
    ComplexityConfig, CLARIFICATION_WEIGHT, ERROR_WEIGHT, MAX_SCORE, SCOPE_WEIGHT, TIME_WEIGHT,
};
use crate::backlog::Story;
use crate::config::STATE_DIR_NAME;
use crate::error::Result;

/// Normalized points per unit of overrun ratio.
const TIME_SCALE: f64 = 2.5;
/// Normalized points per out-of-scope file.
const SCOPE_SCALE: f64 = 2.0;
/// Normalized points per clarification request.
const CLARIFICATION_SCALE: f64 = 2.0;

/// Weighted score plus its normalized (0-10) components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ComplexityScore {
    pub score: f64,
    pub time: f64,
    pub scope: f64,
    pub errors: f64,
    pub clarifications: f64,
}

impl ComplexityScore {
    pub fn meets(&self, threshold: f64) -> bool {
        self.score >= threshold
    }

    /// Name of the component contributing the most weighted points.
    pub fn dominant_signal(&self) -> &'static str {
        let weighted = [
            ("time_overrun", self.time * TIME_WEIGHT),
            ("scope_expansion", self.scope * SCOPE_WEIGHT),
            ("error", self.errors * ERROR_WEIGHT),
            ("clarification", self.clarifications * CLARIFICATION_WEIGHT),
        ];
        weighted
            .iter()
            .fold(("none", 0.0), |best, (name, points)| {
                if *points > best.1 {
                    (*name, *points)
                } else {
                    best
                }
            })
            .0
    }
}

/// Fold a story's signals into a score.
pub fn score_signals<'a, I>(signals: I, config: &ComplexityConfig) -> ComplexityScore
where
    I: IntoIterator<Item = &'a ComplexitySignal>,
{
    let mut max_ratio: f64 = 0.0;
    let mut scope_paths = HashSet::new();
    let mut error_count: u32 = 0;
    let mut clarification_count: u32 = 0;

    for signal in signals {
        match &signal.signal {
            SignalKind::TimeOverrun {
                estimated_secs,
                actual_secs,
            } => {
                let ratio = *actual_secs as f64 / (*estimated_secs).max(1) as f64;
                if ratio > config.overrun_factor {
                    max_ratio = max_ratio.max(ratio);
                }
            }
            SignalKind::ScopeExpansion { path } => {
                scope_paths.insert(path.as_str());
            }
            SignalKind::Error { .. } => error_count += 1,
            SignalKind::Clarification { .. } => clarification_count += 1,
        }
    }

    let time = (TIME_SCALE * max_ratio).min(MAX_SCORE);
    let scope = (SCOPE_SCALE * scope_paths.len() as f64).min(MAX_SCORE);
    let errors = if error_count > config.error_threshold {
        (error_count as f64).min(MAX_SCORE)
    } else {
        0.0
    };
    let clarifications = (CLARIFICATION_SCALE * clarification_count as f64).min(MAX_SCORE);

    let score = TIME_WEIGHT * time
        + SCOPE_WEIGHT * scope
        + ERROR_WEIGHT * errors
        + CLARIFICATION_WEIGHT * clarifications;

    ComplexityScore {
        score: score.min(MAX_SCORE),
        time,
        scope,
        errors,
        clarifications,
    }
}

/// What the engine saw during one delegation.
#[derive(Debug, Clone, Default)]
pub struct AttemptObservation {
    pub elapsed: Duration,
    /// Criteria the agent reports finishing in this attempt.
    pub criteria_met: Option<u32>,
    pub modified_files: Vec<String>,
    pub errors: Vec<String>,
    pub clarifications: Vec<String>,
}

struct ActiveStory {
    story_id: String,
    scope: Vec<String>,
    criterion_estimate: Duration,
    signals: Vec<ComplexitySignal>,
    seen_paths: HashSet<String>,
}

/// Tracks signals for the story currently in flight.
pub struct ComplexityMonitor {
    config: ComplexityConfig,
    log: SignalLog,
    active: Option<ActiveStory>,
}

impl ComplexityMonitor {
    pub fn new(config: ComplexityConfig, log: SignalLog) -> Self {
        Self {
            config,
            log,
            active: None,
        }
    }

    pub fn config(&self) -> &ComplexityConfig {
        &self.config
    }

    pub fn active_story(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.story_id.as_str())
    }

    /// Make `story` the active one. Signals logged for it by earlier runs
    /// are reloaded so a resumed run keeps its score.
    pub fn begin_story(&mut self, story: &Story) -> Result<ComplexityScore> {
        if self.active_story() == Some(story.id.as_str()) {
            return Ok(self.score());
        }
        let signals = self.log.for_story(&story.id)?;
        let seen_paths = signals
            .iter()
            .filter_map(|s| match &s.signal {
                SignalKind::ScopeExpansion { path } => Some(path.clone()),
                _ => None,
            })
            .collect();
        let minutes = self.config.criterion_estimate_minutes(story);
        self.active = Some(ActiveStory {
            story_id: story.id.clone(),
            scope: story.target_files.clone(),
            criterion_estimate: Duration::from_secs_f64(minutes * 60.0),
            signals,
            seen_paths,
        });
        let score = self.score();
        debug!(story_id = %story.id, score = score.score, "complexity tracking started");
        Ok(score)
    }

    pub fn end_story(&mut self) {
        self.active = None;
    }

    /// Append one signal for the active story and rescore.
    pub fn record(&mut self, kind: SignalKind) -> Result<ComplexityScore> {
        let Some(active) = self.active.as_mut() else {
            debug!(signal = kind.label(), "no active story, signal dropped");
            return Ok(ComplexityScore::default());
        };
        if let SignalKind::ScopeExpansion { path } = &kind {
            active.seen_paths.insert(path.clone());
        }
        let signal = ComplexitySignal::new(active.story_id.clone(), kind);
        self.log.append(&signal)?;
        active.signals.push(signal);
        Ok(self.score())
    }

    /// Derive signals from one delegation and rescore.
    pub fn observe_attempt(&mut self, observation: &AttemptObservation) -> Result<ComplexityScore> {
        let mut pending = Vec::new();
        if let Some(active) = self.active.as_ref() {
            let criteria = observation.criteria_met.unwrap_or(1).max(1);
            let estimate = active.criterion_estimate * criteria;
            if observation.elapsed.as_secs_f64()
                > self.config.overrun_factor * estimate.as_secs_f64()
            {
                pending.push(SignalKind::TimeOverrun {
                    estimated_secs: estimate.as_secs(),
                    actual_secs: observation.elapsed.as_secs(),
                });
            }

            if !active.scope.is_empty() {
                for path in &observation.modified_files {
                    if path.starts_with(STATE_DIR_NAME)
                        || active.seen_paths.contains(path)
                        || in_scope(&active.scope, path)
                    {
                        continue;
                    }
                    pending.push(SignalKind::ScopeExpansion { path: path.clone() });
                }
            }
        }
        pending.extend(observation.errors.iter().map(|message| SignalKind::Error {
            message: message.clone(),
        }));
        pending.extend(
            observation
                .clarifications
                .iter()
                .map(|question| SignalKind::Clarification {
                    question: question.clone(),
                }),
        );

        let mut score = self.score();
        for kind in pending {
            score = self.record(kind)?;
        }
        if let Some(story_id) = self.active_story() {
            if score.meets(self.config.threshold) {
                info!(
                    story_id,
                    score = score.score,
                    dominant = score.dominant_signal(),
                    "complexity threshold reached"
                );
            }
        }
        Ok(score)
    }

    /// Current score of the active story (zero when idle).
    pub fn score(&self) -> ComplexityScore {
        match &self.active {
            Some(active) => score_signals(&active.signals, &self.config),
            None => ComplexityScore::default(),
        }
    }

    pub fn should_split(&self) -> bool {
        self.active.is_some() && self.score().meets(self.config.threshold)
    }
}

/// Whether `path` falls within any of the declared scope globs.
pub fn in_scope(scope: &[String], path: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    scope.iter().any(|glob| {
        if glob.ends_with('/') {
            return path.starts_with(glob.as_str());
        }
        if path == glob || path.starts_with(&format!("{}/", glob)) {
            return true;
        }
        match Pattern::new(glob) {
            Ok(pattern) => pattern.matches_with(path, options),
            Err(err) => {
                warn!(glob = %glob, error = %err, "ignoring invalid scope glob");
                false
            }
        }
    })
}
