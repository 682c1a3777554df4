//! Append-only proposal log.

use std::path::{Path, PathBuf};

use super::proposal::SplitProposal;
use crate::config::state_dir;
use crate::error::{RalphError, Result};
use crate::lock::{acquire_best_effort, lock_path_for, LockConfig};
use crate::persist::{append_jsonl, read_jsonl};

const SPLITS_DIR_NAME: &str = "splits";

/// JSONL of proposal revisions for one backlog.
#[derive(Debug, Clone)]
pub struct ProposalLog {
    path: PathBuf,
    lock_config: LockConfig,
}

impl ProposalLog {
    pub fn new(root: &Path, lineage: &str, lock_config: LockConfig) -> Self {
        Self {
            path: state_dir(root)
                .join(SPLITS_DIR_NAME)
                .join(format!("{}.jsonl", lineage)),
            lock_config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, proposal: &SplitProposal) -> Result<()> {
        let _guard = acquire_best_effort(&lock_path_for(&self.path), &self.lock_config);
        append_jsonl(&self.path, proposal)
    }

    /// Newest revision of every proposal, in order of first appearance.
    pub fn latest(&self) -> Result<Vec<SplitProposal>> {
        let mut latest: Vec<SplitProposal> = Vec::new();
        for revision in read_jsonl::<SplitProposal>(&self.path)? {
            match latest.iter_mut().find(|p| p.id == revision.id) {
                Some(existing) if revision.revision >= existing.revision => *existing = revision,
                Some(_) => {}
                None => latest.push(revision),
            }
        }
        Ok(latest)
    }

    pub fn get(&self, id: &str) -> Result<SplitProposal> {
        self.latest()?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| RalphError::UnknownProposal(id.to_string()))
    }

    /// Proposals still awaiting a final decision.
    pub fn open(&self) -> Result<Vec<SplitProposal>> {
        Ok(self
            .latest()?
            .into_iter()
            .filter(|p| p.status.is_open())
            .collect())
    }

    /// Newest proposal for a story, in any state.
    pub fn for_story(&self, story_id: &str) -> Result<Option<SplitProposal>> {
        Ok(self
            .latest()?
            .into_iter()
            .filter(|p| p.story_id == story_id)
            .max_by_key(|p| p.created_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::Story;
    use crate::complexity::{ComplexityConfig, ComplexityScore};
    use crate::split::generator::generate_proposal;
    use crate::split::proposal::ProposalStatus;
    use tempfile::TempDir;

    #[test]
    fn test_latest_revision_wins() {
        let temp_dir = TempDir::new().expect("temp dir");
        let log = ProposalLog::new(temp_dir.path(), "ralph-demo", LockConfig::default());

        let story = Story::new("US-001", "One", 1).with_criteria(&["a", "b", "c"]);
        let proposal = generate_proposal(
            &story,
            &ComplexityScore::default(),
            &ComplexityConfig::default(),
        );
        log.append(&proposal).expect("append");
        log.append(&proposal.revised(ProposalStatus::Deferred))
            .expect("append");

        let all = log.latest().expect("latest");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, ProposalStatus::Deferred);
        assert_eq!(log.open().expect("open").len(), 1);
        assert_eq!(
            log.for_story("US-001").expect("for story").map(|p| p.revision),
            Some(2)
        );
    }

    #[test]
    fn test_get_unknown_proposal() {
        let temp_dir = TempDir::new().expect("temp dir");
        let log = ProposalLog::new(temp_dir.path(), "ralph-demo", LockConfig::default());
        assert!(matches!(
            log.get("sp-missing"),
            Err(RalphError::UnknownProposal(_))
        ));
    }
}
