//! Error classification used to decide between retrying and halting.

use serde::{Deserialize, Serialize};

/// Broad category of a failure, carrying a short human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Delegation hiccup, IO blip or lock contention; retried on the next iteration.
    Transient(String),
    /// The delegate or gate call ran past its wall-clock bound.
    Timeout(String),
    /// Structural or validation failure; retrying cannot resolve it.
    Fatal(String),
}

impl ErrorCategory {
    /// Whether the iteration loop may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient(_) | ErrorCategory::Timeout(_))
    }

    /// Stable label for audit records.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::Transient(_) => "transient",
            ErrorCategory::Timeout(_) => "timeout",
            ErrorCategory::Fatal(_) => "fatal",
        }
    }
}
