//! Backlog store: stories, selection and structural validation.

pub mod select;
pub mod store;
pub mod story;
pub mod validate;

pub use select::{dependencies_met, eligible_stories, select_next_story, Selection};
pub use store::{BacklogStore, DEFAULT_BACKLOG_FILE};
pub use story::{sanitize_component, Backlog, ComplexityTier, Story};
pub use validate::validate_backlog;
