//! Approval protocol for split proposals.

use async_trait::async_trait;
use tracing::info;

use super::proposal::{ProposalEdit, SplitProposal};

/// Operator's answer to a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitDecision {
    Approve,
    Reject(String),
    /// Modify, then ask again.
    Edit(ProposalEdit),
    Defer,
}

/// Decides what happens to a freshly generated proposal.
#[async_trait]
pub trait SplitApprover: Send + Sync {
    async fn review(&self, proposal: &SplitProposal) -> SplitDecision;
}

/// Parks every proposal for later review with `ralph split`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeferApprover;

#[async_trait]
impl SplitApprover for DeferApprover {
    async fn review(&self, proposal: &SplitProposal) -> SplitDecision {
        info!(
            proposal_id = %proposal.id,
            story_id = %proposal.story_id,
            "split proposal deferred for operator review"
        );
        SplitDecision::Defer
    }
}

/// Approves every proposal (`--auto-split`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl SplitApprover for AutoApprove {
    async fn review(&self, _proposal: &SplitProposal) -> SplitDecision {
        SplitDecision::Approve
    }
}
