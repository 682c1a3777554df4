//! Decompose a story into a chain of sub-stories.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::proposal::{
    ProposalStatus, ProposedStory, SplitProposal, MAX_SUB_STORIES, MIN_SUB_STORIES,
};
use crate::backlog::{ComplexityTier, Story};
use crate::complexity::{ComplexityConfig, ComplexityScore};

/// Floor for a sub-story estimate.
const MIN_SUB_STORY_MINUTES: u32 = 5;

/// `sp-` followed by 12 hex chars of sha256(parent id + timestamp).
pub fn proposal_id(story_id: &str, created_at: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(story_id.as_bytes());
    hasher.update(created_at.to_rfc3339().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("sp-{}", &digest[..12])
}

/// Number of sub-stories for `criteria` acceptance criteria.
pub fn sub_story_count(criteria: usize) -> usize {
    criteria.div_ceil(2).clamp(MIN_SUB_STORIES, MAX_SUB_STORIES)
}

/// Build a pending proposal splitting `story`.
///
/// Criteria are partitioned into contiguous groups in their original order,
/// earlier groups taking the remainder. Empty groups become a scaffolding
/// step (first) or a verification step (otherwise).
pub fn generate_proposal(
    story: &Story,
    score: &ComplexityScore,
    config: &ComplexityConfig,
) -> SplitProposal {
    let criteria = &story.acceptance_criteria;
    let k = sub_story_count(criteria.len());
    let total_minutes = story.estimated_minutes.unwrap_or_else(|| {
        (config.criterion_estimate_minutes(story) * criteria.len().max(1) as f64).round() as u32
    });
    let minutes = (total_minutes / k as u32).max(MIN_SUB_STORY_MINUTES);
    let tier = match story.complexity {
        ComplexityTier::Large => ComplexityTier::Medium,
        ComplexityTier::Medium | ComplexityTier::Small => ComplexityTier::Small,
    };

    let base = criteria.len() / k;
    let extra = criteria.len() % k;
    let mut start = 0;
    let mut sub_stories = Vec::with_capacity(k);
    for part in 0..k {
        let len = base + usize::from(part < extra);
        let group = &criteria[start..start + len];
        start += len;

        let (title, acceptance_criteria) = if !group.is_empty() {
            (
                format!("{} (part {} of {})", story.title, part + 1, k),
                group.to_vec(),
            )
        } else if part == 0 {
            (
                format!("Scaffold {}", story.title),
                vec![format!(
                    "Scaffolding for {} is in place and builds",
                    story.id
                )],
            )
        } else {
            (
                format!("Verify {}", story.title),
                vec![
                    format!("All acceptance criteria of {} verified end to end", story.id),
                    "Quality checks pass".to_string(),
                ],
            )
        };

        let mut description = story.description.clone();
        if !description.is_empty() {
            description.push_str("\n\n");
        }
        description.push_str(&format!("Part {} of {} split from {}.", part + 1, k, story.id));

        sub_stories.push(ProposedStory {
            title,
            description,
            acceptance_criteria,
            target_files: story.target_files.clone(),
            complexity: tier,
            estimated_minutes: Some(minutes),
        });
    }

    let created_at = Utc::now();
    SplitProposal {
        id: proposal_id(&story.id, &created_at),
        story_id: story.id.clone(),
        score: score.score,
        threshold: config.threshold,
        dominant_signal: score.dominant_signal().to_string(),
        sub_stories,
        status: ProposalStatus::Pending,
        reason: None,
        applied_ids: Vec::new(),
        revision: 1,
        created_at,
        updated_at: created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score() -> ComplexityScore {
        ComplexityScore {
            score: 8.2,
            time: 10.0,
            scope: 4.0,
            errors: 10.0,
            clarifications: 8.0,
        }
    }

    #[test]
    fn test_sub_story_count_bounds() {
        assert_eq!(sub_story_count(0), 2);
        assert_eq!(sub_story_count(1), 2);
        assert_eq!(sub_story_count(4), 2);
        assert_eq!(sub_story_count(5), 3);
        assert_eq!(sub_story_count(8), 4);
        assert_eq!(sub_story_count(30), 5);
    }

    #[test]
    fn test_criteria_partitioned_in_order() {
        let story = Story::new("US-007", "Checkout", 3)
            .with_criteria(&["a", "b", "c", "d", "e"])
            .with_target_files(&["src/checkout/**"]);
        let proposal = generate_proposal(&story, &score(), &ComplexityConfig::default());

        assert_eq!(proposal.sub_stories.len(), 3);
        let groups: Vec<Vec<String>> = proposal
            .sub_stories
            .iter()
            .map(|s| s.acceptance_criteria.clone())
            .collect();
        assert_eq!(groups, vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]);
        assert!(proposal
            .sub_stories
            .iter()
            .all(|s| s.target_files == vec!["src/checkout/**".to_string()]));
        assert_eq!(proposal.status, ProposalStatus::Pending);
        assert!(proposal.check_shape().is_ok());
    }

    #[test]
    fn test_single_criterion_padded_with_verification() {
        let story = Story::new("US-002", "Login", 1).with_criteria(&["user can log in"]);
        let proposal = generate_proposal(&story, &score(), &ComplexityConfig::default());

        assert_eq!(proposal.sub_stories.len(), 2);
        assert_eq!(proposal.sub_stories[0].acceptance_criteria, vec!["user can log in"]);
        assert!(proposal.sub_stories[1].title.starts_with("Verify"));
    }

    #[test]
    fn test_no_criteria_scaffold_then_verify() {
        let story = Story::new("US-003", "Spike", 1);
        let proposal = generate_proposal(&story, &score(), &ComplexityConfig::default());
        assert!(proposal.sub_stories[0].title.starts_with("Scaffold"));
        assert!(proposal.sub_stories[1].title.starts_with("Verify"));
    }

    #[test]
    fn test_estimates_divided_with_floor() {
        let mut story = Story::new("US-004", "Big", 1).with_criteria(&["a", "b", "c", "d"]);
        story.estimated_minutes = Some(120);
        let proposal = generate_proposal(&story, &score(), &ComplexityConfig::default());
        assert!(proposal
            .sub_stories
            .iter()
            .all(|s| s.estimated_minutes == Some(60)));

        story.estimated_minutes = Some(6);
        let proposal = generate_proposal(&story, &score(), &ComplexityConfig::default());
        assert_eq!(proposal.sub_stories[0].estimated_minutes, Some(5));
    }

    #[test]
    fn test_proposal_id_format() {
        let id = proposal_id("US-001", &Utc::now());
        assert!(id.starts_with("sp-"));
        assert_eq!(id.len(), 15);
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
