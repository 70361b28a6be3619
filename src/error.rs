//! Error taxonomy for the orchestration engine
//!
//! Every failure mode the engine can surface to a caller lives here.
//! Ambiguity suspends the state machine rather than erroring, but it is
//! still representable so library callers can propagate it.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Request intent or scope could not be resolved without asking.
    #[error("ambiguous request: {question}")]
    AmbiguousRequest { question: String },

    /// A hunk's recorded context or removed lines do not match the tree.
    #[error("hunk conflict in {} at line {line}: expected {expected:?}, found {found:?}", path.display())]
    HunkConflict {
        path: PathBuf,
        line: usize,
        expected: String,
        found: String,
    },

    /// A path appears in more than one of {modified, created, deleted},
    /// or a creation targets a path that already exists.
    #[error("path collision: {detail} ({})", path.display())]
    PathCollision { path: PathBuf, detail: String },

    /// Malformed unified diff or protocol text.
    #[error("parse error at line {line}: {message}")]
    ParseError { line: usize, message: String },

    /// A clarifying-question answer missing its free-text slot.
    #[error("malformed answer: {reason}")]
    MalformedAnswer { reason: String },

    /// A validation command exceeded its time bound.
    #[error("command timed out after {seconds}s: {command}")]
    Timeout { command: String, seconds: u64 },

    /// The iterate/retry loop ran out of budget.
    #[error("iteration budget exhausted after {attempts} attempts")]
    IterationBudgetExhausted { attempts: usize },

    /// The external planning service failed to produce a usable proposal.
    #[error("planner failed: {0}")]
    PlannerFailed(String),

    /// A scope glob that does not compile.
    #[error("invalid scope glob {pattern:?}: {message}")]
    InvalidScope { pattern: String, message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        EngineError::ParseError {
            line,
            message: message.into(),
        }
    }

    /// True for failures that must abort the current patch attempt
    /// instead of feeding the retry loop.
    pub fn is_fatal_to_patch(&self) -> bool {
        matches!(
            self,
            EngineError::HunkConflict { .. } | EngineError::PathCollision { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let conflict = EngineError::HunkConflict {
            path: PathBuf::from("src/a.ts"),
            line: 3,
            expected: "old".to_string(),
            found: "new".to_string(),
        };
        assert!(conflict.is_fatal_to_patch());

        let timeout = EngineError::Timeout {
            command: "npm test".to_string(),
            seconds: 30,
        };
        assert!(!timeout.is_fatal_to_patch());
    }

    #[test]
    fn test_display_includes_location() {
        let err = EngineError::parse(12, "bad hunk header");
        assert!(err.to_string().contains("line 12"));
    }
}
