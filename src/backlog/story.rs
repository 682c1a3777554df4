//! Story and Backlog document types.

use serde::{Deserialize, Serialize};

/// Coarse size estimate attached to a story.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Small,
    #[default]
    Medium,
    Large,
}

/// A unit of work with acceptance criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Lower is more urgent.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub passes: bool,
    /// Globs of paths this story may touch.
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub complexity: ComplexityTier,
    /// Optional whole-story estimate; overrides the tier default when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub notes: String,
    /// Set once the story has been decomposed; a split story is never selected again.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub split: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_proposal_id: Option<String>,
}

impl Story {
    /// Create a minimal story; remaining fields take their defaults.
    pub fn new(id: impl Into<String>, title: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            priority,
            passes: false,
            target_files: Vec::new(),
            complexity: ComplexityTier::default(),
            estimated_minutes: None,
            depends_on: Vec::new(),
            notes: String::new(),
            split: false,
            split_proposal_id: None,
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_criteria(mut self, criteria: &[&str]) -> Self {
        self.acceptance_criteria = criteria.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_target_files(mut self, files: &[&str]) -> Self {
        self.target_files = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_passes(mut self, passes: bool) -> Self {
        self.passes = passes;
        self
    }

    /// Whether the story still needs work. Split parents are historical markers.
    pub fn is_open(&self) -> bool {
        !self.passes && !self.split
    }

    /// Append a line to the free-text notes.
    pub fn append_note(&mut self, note: &str) {
        if !self.notes.is_empty() && !self.notes.ends_with('\n') {
            self.notes.push('\n');
        }
        self.notes.push_str(note);
    }
}

/// Ordered collection of stories for one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backlog {
    pub project: String,
    /// Target branch; also the lineage name for checkpoints and sessions.
    pub branch_name: String,
    #[serde(default)]
    pub description: String,
    /// Workspace reference the isolated copies are derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    pub user_stories: Vec<Story>,
}

impl Backlog {
    pub fn new(project: impl Into<String>, branch_name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            branch_name: branch_name.into(),
            description: String::new(),
            source_ref: None,
            user_stories: Vec::new(),
        }
    }

    pub fn with_stories(mut self, stories: Vec<Story>) -> Self {
        self.user_stories = stories;
        self
    }

    pub fn story(&self, id: &str) -> Option<&Story> {
        self.user_stories.iter().find(|s| s.id == id)
    }

    pub fn story_mut(&mut self, id: &str) -> Option<&mut Story> {
        self.user_stories.iter_mut().find(|s| s.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.user_stories.iter().position(|s| s.id == id)
    }

    /// Number of stories that still need work.
    pub fn incomplete_count(&self) -> usize {
        self.user_stories.iter().filter(|s| s.is_open()).count()
    }

    /// Ids of stories that still need work, in backlog order.
    pub fn incomplete_ids(&self) -> Vec<String> {
        self.user_stories
            .iter()
            .filter(|s| s.is_open())
            .map(|s| s.id.clone())
            .collect()
    }

    /// (passed, selectable total), excluding split parents.
    pub fn progress(&self) -> (usize, usize) {
        let total = self.user_stories.iter().filter(|s| !s.split).count();
        let passed = self.user_stories.iter().filter(|s| s.passes).count();
        (passed, total)
    }

    /// Stable identity used to key checkpoints, sessions and logs.
    pub fn lineage(&self) -> String {
        sanitize_component(&self.branch_name)
    }
}

/// Make a string safe to use as a single path component.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}
