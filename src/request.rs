//! Refactor requests
//!
//! A request is immutable once accepted: free-text goal, optional scope
//! globs, constraint flags. The ambiguity predicate lives here too; an
//! ambiguous request is never guessed at, it suspends the engine until
//! the caller answers.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::tree::WorkingTree;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Constraint flags accepted at intake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub no_new_dependencies: bool,
    pub behavior_preserving: bool,
    pub allow_breaking: bool,
}

impl Constraints {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            no_new_dependencies: config.no_new_dependencies,
            behavior_preserving: config.behavior_preserving,
            allow_breaking: config.allow_breaking,
        }
    }
}

/// On-disk request file: goal plus optional scope and constraint
/// overrides
#[derive(Debug, Deserialize)]
struct RequestFile {
    goal: String,
    #[serde(default)]
    scope: Vec<String>,
    no_new_dependencies: Option<bool>,
    behavior_preserving: Option<bool>,
    allow_breaking: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct RefactorRequest {
    pub id: Uuid,
    pub goal: String,
    /// Path globs limiting where the refactor may act; empty means the
    /// whole tree
    pub scope: Vec<String>,
    pub constraints: Constraints,
    pub accepted_at: DateTime<Utc>,
}

impl RefactorRequest {
    pub fn new(goal: String, scope: Vec<String>, constraints: Constraints) -> Self {
        Self {
            id: Uuid::new_v4(),
            goal,
            scope,
            constraints,
            accepted_at: Utc::now(),
        }
    }

    /// Parse a JSON request file, filling constraint gaps from config
    /// defaults.
    pub fn from_json(raw: &str, defaults: &Constraints) -> Result<Self> {
        let file: RequestFile = serde_json::from_str(raw).map_err(|e| {
            EngineError::parse(e.line(), format!("invalid request file: {}", e))
        })?;
        let constraints = Constraints {
            no_new_dependencies: file
                .no_new_dependencies
                .unwrap_or(defaults.no_new_dependencies),
            behavior_preserving: file
                .behavior_preserving
                .unwrap_or(defaults.behavior_preserving),
            allow_breaking: file.allow_breaking.unwrap_or(defaults.allow_breaking),
        };
        Ok(Self::new(file.goal, file.scope, constraints))
    }

    /// Compile the scope globs into one matcher.
    pub fn compile_scope(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.scope {
            builder.add(Glob::new(pattern).map_err(|e| EngineError::InvalidScope {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?);
        }
        builder.build().map_err(|e| EngineError::InvalidScope {
            pattern: self.scope.join(", "),
            message: e.to_string(),
        })
    }

    /// Decide whether this request can proceed without clarification.
    ///
    /// Returns the question to ask, or `None` when the request is
    /// actionable. Rules, in order:
    /// 1. empty goal
    /// 2. conflicting constraints (behavior-preserving and breaking)
    /// 3. scope globs that match nothing in the tree
    /// 4. a wildcard glob matching several files when the goal names
    ///    none of them
    ///
    /// `answered` holds questions the caller has already responded to;
    /// an answered question never re-triggers. The engine forwards the
    /// answer text to the planner, it does not interpret it.
    pub fn ambiguity(
        &self,
        tree: &WorkingTree,
        answered: &[String],
    ) -> Result<Option<String>> {
        let question = |q: String| {
            if answered.contains(&q) {
                None
            } else {
                Some(q)
            }
        };

        if self.goal.trim().is_empty() {
            if let Some(q) = question(
                "The request has no goal text. What should be refactored, and toward what outcome?"
                    .to_string(),
            ) {
                return Ok(Some(q));
            }
        }

        if self.constraints.behavior_preserving && self.constraints.allow_breaking {
            if let Some(q) = question(
                "The request is marked both behavior-preserving and allowed to break public API. Which constraint wins?"
                    .to_string(),
            ) {
                return Ok(Some(q));
            }
        }

        if !self.scope.is_empty() {
            let set = self.compile_scope()?;
            if !tree.paths().any(|p| set.is_match(p)) {
                if let Some(q) = question(format!(
                    "No files match the requested scope ({}). Which files should be refactored?",
                    self.scope.join(", ")
                )) {
                    return Ok(Some(q));
                }
            }
        }

        for pattern in &self.scope {
            if !pattern.contains(['*', '?', '[']) {
                continue;
            }
            let glob = Glob::new(pattern)
                .map_err(|e| EngineError::InvalidScope {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })?
                .compile_matcher();
            let candidates: Vec<&PathBuf> =
                tree.paths().filter(|p| glob.is_match(p)).collect();
            if candidates.len() < 2 {
                continue;
            }
            let named = candidates.iter().any(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| self.goal.contains(n))
                    .unwrap_or(false)
            });
            if !named {
                let listed: Vec<String> =
                    candidates.iter().map(|p| p.display().to_string()).collect();
                let q = format!(
                    "Scope glob {:?} matches several candidates: {}. Which file should this refactor target?",
                    pattern,
                    listed.join(", ")
                );
                if let Some(q) = question(q) {
                    return Ok(Some(q));
                }
            }
        }

        Ok(None)
    }
}
