//! Next-story selection.

use crate::backlog::story::{Backlog, Story};
use crate::error::{RalphError, Result};

/// Outcome of a selection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection<'a> {
    /// The story to work on next.
    Next(&'a Story),
    /// Nothing left to do.
    AllComplete,
}

/// Whether every dependency of `story` has `passes == true`.
///
/// An unknown dependency counts as unmet; validation reports it separately.
pub fn dependencies_met(backlog: &Backlog, story: &Story) -> bool {
    story
        .depends_on
        .iter()
        .all(|dep| backlog.story(dep).map(|s| s.passes).unwrap_or(false))
}

/// Pick the open story with met dependencies and the lowest priority number.
/// Ties go to the earlier story in backlog order.
///
/// Returns [`RalphError::Deadlock`] when open stories remain but none is eligible.
pub fn select_next_story(backlog: &Backlog) -> Result<Selection<'_>> {
    let mut best: Option<&Story> = None;
    for story in backlog.user_stories.iter().filter(|s| s.is_open()) {
        if !dependencies_met(backlog, story) {
            continue;
        }
        // Strict comparison keeps the earliest story on ties
        if best.map_or(true, |b| story.priority < b.priority) {
            best = Some(story);
        }
    }

    match best {
        Some(story) => Ok(Selection::Next(story)),
        None if backlog.incomplete_count() == 0 => Ok(Selection::AllComplete),
        None => Err(RalphError::Deadlock {
            incomplete: backlog.incomplete_ids(),
        }),
    }
}

/// Open stories whose dependencies are all met, in selection order.
pub fn eligible_stories(backlog: &Backlog) -> Vec<&Story> {
    let mut eligible: Vec<(usize, &Story)> = backlog
        .user_stories
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_open() && dependencies_met(backlog, s))
        .collect();
    eligible.sort_by_key(|(index, s)| (s.priority, *index));
    eligible.into_iter().map(|(_, s)| s).collect()
}
