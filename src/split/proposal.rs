//! Split proposal records and operator edits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backlog::ComplexityTier;
use crate::error::{RalphError, Result};

/// Fewest sub-stories a proposal may hold.
pub const MIN_SUB_STORIES: usize = 2;
/// Most sub-stories a proposal may hold.
pub const MAX_SUB_STORIES: usize = 5;

/// Lifecycle of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    /// Modified by the operator, awaiting approve or reject.
    Edited,
    Approved,
    Rejected,
    /// Parked; the original story keeps running.
    Deferred,
}

impl ProposalStatus {
    /// Still awaiting a final decision.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Pending | ProposalStatus::Edited | ProposalStatus::Deferred
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Edited => "edited",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Deferred => "deferred",
        }
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sub-story without an id; ids derive from the parent on apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedStory {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub complexity: ComplexityTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<u32>,
}

/// One revision of a proposal. The log keeps every revision; the newest
/// per id wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitProposal {
    pub id: String,
    pub story_id: String,
    pub score: f64,
    pub threshold: f64,
    /// Signal that contributed most to the score.
    pub dominant_signal: String,
    pub sub_stories: Vec<ProposedStory>,
    pub status: ProposalStatus,
    /// Operator reason for a rejection or deferral.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Ids assigned when approved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_ids: Vec<String>,
    pub revision: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SplitProposal {
    /// Id the `index`th (0-based) sub-story receives.
    pub fn sub_story_id(&self, index: usize) -> String {
        format!("{}.{}", self.story_id, index + 1)
    }

    /// Copy of this proposal as the next revision in `status`.
    pub fn revised(&self, status: ProposalStatus) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.revision += 1;
        next.updated_at = Utc::now();
        next
    }

    /// Reject shapes that cannot be applied.
    pub fn check_shape(&self) -> Result<()> {
        let count = self.sub_stories.len();
        if !(MIN_SUB_STORIES..=MAX_SUB_STORIES).contains(&count) {
            return Err(RalphError::InvalidProposal(format!(
                "{} has {} sub-stories, expected {}-{}",
                self.id, count, MIN_SUB_STORIES, MAX_SUB_STORIES
            )));
        }
        if let Some(index) = self
            .sub_stories
            .iter()
            .position(|s| s.title.trim().is_empty())
        {
            return Err(RalphError::InvalidProposal(format!(
                "{} sub-story {} has an empty title",
                self.id,
                index + 1
            )));
        }
        Ok(())
    }
}

/// Changes to one existing sub-story. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubStoryEdit {
    /// 1-based position in the proposal.
    pub index: usize,
    pub title: Option<String>,
    pub description: Option<String>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub target_files: Option<Vec<String>>,
    pub estimated_minutes: Option<u32>,
}

/// Operator edit: field changes, then removals, then additions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProposalEdit {
    pub changes: Vec<SubStoryEdit>,
    /// 1-based positions to drop.
    pub remove: Vec<usize>,
    pub add: Vec<ProposedStory>,
}

impl ProposalEdit {
    /// Apply to `proposal` in place. The result must still hold 2-5 sub-stories.
    pub fn apply_to(&self, proposal: &mut SplitProposal) -> Result<()> {
        let count = proposal.sub_stories.len();
        let out_of_range = |index: usize| index == 0 || index > count;

        for change in &self.changes {
            if out_of_range(change.index) {
                return Err(RalphError::InvalidProposal(format!(
                    "no sub-story {} in {}",
                    change.index, proposal.id
                )));
            }
            let sub = &mut proposal.sub_stories[change.index - 1];
            if let Some(title) = &change.title {
                sub.title = title.clone();
            }
            if let Some(description) = &change.description {
                sub.description = description.clone();
            }
            if let Some(criteria) = &change.acceptance_criteria {
                sub.acceptance_criteria = criteria.clone();
            }
            if let Some(files) = &change.target_files {
                sub.target_files = files.clone();
            }
            if let Some(minutes) = change.estimated_minutes {
                sub.estimated_minutes = Some(minutes);
            }
        }

        let mut remove = self.remove.clone();
        remove.sort_unstable();
        remove.dedup();
        if let Some(bad) = remove.iter().copied().find(|i| out_of_range(*i)) {
            return Err(RalphError::InvalidProposal(format!(
                "no sub-story {} in {}",
                bad, proposal.id
            )));
        }
        for index in remove.into_iter().rev() {
            proposal.sub_stories.remove(index - 1);
        }
        proposal.sub_stories.extend(self.add.iter().cloned());

        proposal.check_shape()
    }
}
