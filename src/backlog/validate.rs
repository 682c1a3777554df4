//! Structural integrity checks for a backlog.

use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::backlog::story::Backlog;
use crate::error::BacklogError;

/// Check ids are non-empty and unique, dependencies exist, and the
/// dependency graph is acyclic.
pub fn validate_backlog(backlog: &Backlog) -> Result<(), BacklogError> {
    let mut seen = HashSet::new();
    for (index, story) in backlog.user_stories.iter().enumerate() {
        if story.id.trim().is_empty() {
            return Err(BacklogError::EmptyId(index));
        }
        if !seen.insert(story.id.as_str()) {
            return Err(BacklogError::DuplicateId(story.id.clone()));
        }
    }

    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for story in &backlog.user_stories {
        graph.add_node(story.id.as_str());
    }
    for story in &backlog.user_stories {
        for dep in &story.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(BacklogError::UnknownDependency {
                    story_id: story.id.clone(),
                    dependency: dep.clone(),
                });
            }
            if dep == &story.id {
                return Err(BacklogError::DependencyCycle(story.id.clone()));
            }
            graph.add_edge(dep.as_str(), story.id.as_str(), ());
        }
    }

    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| BacklogError::DependencyCycle(cycle.node_id().to_string()))
}
