//! Backlog mutation for an approved proposal.

use super::proposal::SplitProposal;
use crate::backlog::{Backlog, Story};
use crate::error::{BacklogError, RalphError, Result};

/// A story can be split only while it is neither split nor complete.
pub(super) fn check_splittable(story: &Story) -> Result<()> {
    if story.split {
        return Err(RalphError::InvalidProposal(format!(
            "story {} is already split",
            story.id
        )));
    }
    if story.passes {
        return Err(RalphError::InvalidProposal(format!(
            "story {} is already complete",
            story.id
        )));
    }
    Ok(())
}

/// Insert the proposal's sub-stories after the parent and retire the parent.
///
/// Sub-stories take the parent's priority, the first inherits the parent's
/// dependencies and each later one depends on its predecessor. Stories that
/// depended on the parent now depend on the last sub-story. The caller is
/// responsible for validating the result before persisting it.
pub fn apply_split(backlog: &mut Backlog, proposal: &SplitProposal) -> Result<Vec<String>> {
    proposal.check_shape()?;
    let position = backlog
        .position(&proposal.story_id)
        .ok_or_else(|| BacklogError::UnknownStory(proposal.story_id.clone()))?;
    let parent = backlog.user_stories[position].clone();
    check_splittable(&parent)?;

    let ids: Vec<String> = (0..proposal.sub_stories.len())
        .map(|i| proposal.sub_story_id(i))
        .collect();

    let mut subs = Vec::with_capacity(ids.len());
    for (index, proposed) in proposal.sub_stories.iter().enumerate() {
        let depends_on = if index == 0 {
            parent.depends_on.clone()
        } else {
            vec![ids[index - 1].clone()]
        };
        subs.push(Story {
            id: ids[index].clone(),
            title: proposed.title.clone(),
            description: proposed.description.clone(),
            acceptance_criteria: proposed.acceptance_criteria.clone(),
            priority: parent.priority,
            passes: false,
            target_files: proposed.target_files.clone(),
            complexity: proposed.complexity,
            estimated_minutes: proposed.estimated_minutes,
            depends_on,
            notes: String::new(),
            split: false,
            split_proposal_id: None,
        });
    }

    if let Some(last) = ids.last() {
        for story in backlog.user_stories.iter_mut() {
            for dep in story.depends_on.iter_mut() {
                if *dep == parent.id {
                    *dep = last.clone();
                }
            }
        }
    }

    let tail = backlog.user_stories.split_off(position + 1);
    backlog.user_stories.extend(subs);
    backlog.user_stories.extend(tail);

    let parent = &mut backlog.user_stories[position];
    parent.split = true;
    parent.passes = false;
    parent.split_proposal_id = Some(proposal.id.clone());
    parent.append_note(&format!(
        "Split by {} into {}",
        proposal.id,
        ids.join(", ")
    ));

    Ok(ids)
}
