//! Adaptive story splitting.
//!
//! When a story's complexity score reaches the threshold a [`SplitProposal`]
//! is generated and handed to a [`SplitApprover`]. An approved proposal is
//! applied to the backlog in one validated, locked rewrite; the parent story
//! is backed up first.

pub mod apply;
pub mod approval;
pub mod generator;
pub mod log;
pub mod proposal;

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::backlog::{BacklogStore, Story};
use crate::complexity::{ComplexityConfig, ComplexityScore};
use crate::config::state_dir;
use crate::error::{RalphError, Result};
use crate::lock::LockConfig;
use crate::persist::write_json_atomic;

pub use apply::apply_split;
use apply::check_splittable;
pub use approval::{AutoApprove, DeferApprover, SplitApprover, SplitDecision};
pub use generator::{generate_proposal, proposal_id, sub_story_count};
pub use log::ProposalLog;
pub use proposal::{
    ProposalEdit, ProposalStatus, ProposedStory, SplitProposal, SubStoryEdit, MAX_SUB_STORIES,
    MIN_SUB_STORIES,
};

const BACKUPS_DIR_NAME: &str = "split-backups";
/// Edit rounds allowed before a proposal is parked.
const MAX_EDIT_ROUNDS: usize = 5;

/// Where a proposal ended up after review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    Applied {
        proposal_id: String,
        sub_story_ids: Vec<String>,
    },
    Rejected {
        proposal_id: String,
    },
    Deferred {
        proposal_id: String,
    },
}

/// Proposal lifecycle for one backlog.
#[derive(Debug, Clone)]
pub struct Splitter {
    store: BacklogStore,
    log: ProposalLog,
    backups_dir: PathBuf,
    config: ComplexityConfig,
}

impl Splitter {
    pub fn new(
        root: &Path,
        lineage: &str,
        store: BacklogStore,
        config: ComplexityConfig,
        lock_config: LockConfig,
    ) -> Self {
        Self {
            store,
            log: ProposalLog::new(root, lineage, lock_config),
            backups_dir: state_dir(root).join(BACKUPS_DIR_NAME),
            config,
        }
    }

    pub fn log(&self) -> &ProposalLog {
        &self.log
    }

    /// True once any proposal exists for the story. A story is proposed for
    /// at most once; later decisions go through the operator commands.
    pub fn has_proposal(&self, story_id: &str) -> Result<bool> {
        Ok(self.log.for_story(story_id)?.is_some())
    }

    /// Generate and record a pending proposal.
    pub fn propose(&self, story: &Story, score: &ComplexityScore) -> Result<SplitProposal> {
        let proposal = generate_proposal(story, score, &self.config);
        self.log.append(&proposal)?;
        info!(
            proposal_id = %proposal.id,
            story_id = %story.id,
            score = score.score,
            threshold = self.config.threshold,
            sub_stories = proposal.sub_stories.len(),
            "split proposed"
        );
        Ok(proposal)
    }

    /// Drive a proposal through the approver until it is resolved.
    pub async fn resolve(
        &self,
        proposal: SplitProposal,
        approver: &dyn SplitApprover,
    ) -> Result<SplitOutcome> {
        let mut current = proposal;
        for _ in 0..MAX_EDIT_ROUNDS {
            match approver.review(&current).await {
                SplitDecision::Approve => {
                    let sub_story_ids = self.approve(&current.id)?;
                    return Ok(SplitOutcome::Applied {
                        proposal_id: current.id,
                        sub_story_ids,
                    });
                }
                SplitDecision::Reject(reason) => {
                    self.reject(&current.id, &reason)?;
                    return Ok(SplitOutcome::Rejected {
                        proposal_id: current.id,
                    });
                }
                SplitDecision::Defer => {
                    self.defer(&current.id)?;
                    return Ok(SplitOutcome::Deferred {
                        proposal_id: current.id,
                    });
                }
                SplitDecision::Edit(edit) => {
                    current = self.edit(&current.id, &edit)?;
                }
            }
        }
        warn!(proposal_id = %current.id, "too many edit rounds, deferring");
        self.defer(&current.id)?;
        Ok(SplitOutcome::Deferred {
            proposal_id: current.id,
        })
    }

    /// Apply an open proposal to the backlog. Returns the new sub-story ids.
    ///
    /// On a validation failure the backlog is left as it was and the
    /// proposal stays open.
    pub fn approve(&self, id: &str) -> Result<Vec<String>> {
        let proposal = self.open_proposal(id, "approved")?;

        let backlog = self.store.load()?;
        let parent = backlog.story(&proposal.story_id).ok_or_else(|| {
            RalphError::InvalidProposal(format!("story {} no longer exists", proposal.story_id))
        })?;
        check_splittable(parent)?;
        self.backup_parent(parent, &proposal.id)?;

        let ids = self.store.update(|backlog| apply_split(backlog, &proposal))?;

        let mut approved = proposal.revised(ProposalStatus::Approved);
        approved.applied_ids = ids.clone();
        self.log.append(&approved)?;
        info!(
            proposal_id = %id,
            story_id = %approved.story_id,
            sub_stories = %ids.join(","),
            "split applied"
        );
        Ok(ids)
    }

    pub fn reject(&self, id: &str, reason: &str) -> Result<SplitProposal> {
        let mut rejected = self
            .open_proposal(id, "rejected")?
            .revised(ProposalStatus::Rejected);
        rejected.reason = Some(reason.to_string());
        self.log.append(&rejected)?;
        info!(proposal_id = %id, reason, "split rejected");
        Ok(rejected)
    }

    pub fn defer(&self, id: &str) -> Result<SplitProposal> {
        let proposal = self.open_proposal(id, "deferred")?;
        if proposal.status == ProposalStatus::Deferred {
            return Ok(proposal);
        }
        let deferred = proposal.revised(ProposalStatus::Deferred);
        self.log.append(&deferred)?;
        Ok(deferred)
    }

    pub fn edit(&self, id: &str, edit: &ProposalEdit) -> Result<SplitProposal> {
        let mut edited = self
            .open_proposal(id, "edited")?
            .revised(ProposalStatus::Edited);
        edit.apply_to(&mut edited)?;
        self.log.append(&edited)?;
        Ok(edited)
    }

    /// Proposals awaiting a decision.
    pub fn list_open(&self) -> Result<Vec<SplitProposal>> {
        self.log.open()
    }

    pub fn get(&self, id: &str) -> Result<SplitProposal> {
        self.log.get(id)
    }

    pub fn backup_path(&self, story_id: &str, proposal_id: &str) -> PathBuf {
        self.backups_dir
            .join(format!("{}-{}.json", story_id, proposal_id))
    }

    fn backup_parent(&self, parent: &Story, proposal_id: &str) -> Result<()> {
        write_json_atomic(&self.backup_path(&parent.id, proposal_id), parent)
    }

    fn open_proposal(&self, id: &str, action: &str) -> Result<SplitProposal> {
        let proposal = self.log.get(id)?;
        if !proposal.status.is_open() {
            return Err(RalphError::ProposalState {
                id: id.to_string(),
                action: action.to_string(),
                status: proposal.status.to_string(),
            });
        }
        Ok(proposal)
    }
}
