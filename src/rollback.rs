//! Precomputed patch inversion
//!
//! A rollback plan is built from the pre-apply tree before any change is
//! committed, so the engine can always restore the exact prior state. It
//! carries two equivalent views: the inverse patch set (for review in the
//! ROLLBACK protocol section) and the prior file contents keyed by path
//! (for execution, which stays correct even if a later tool run, such as
//! a formatter, drifted the patched files).

use crate::diff::{FileDiff, PatchSet};
use crate::error::{EngineError, Result};
use crate::tree::WorkingTree;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackPlan {
    /// Inverse of the applied patch: revert hunks, delete created files,
    /// recreate deleted files with their prior content.
    pub inverse: PatchSet,
    /// Pre-apply content per touched path; `None` means the path did not
    /// exist before the patch.
    prior: BTreeMap<PathBuf, Option<String>>,
}

impl RollbackPlan {
    /// Compute the plan for `patch` against the pre-apply tree. Pure, and
    /// must succeed before apply commits: a patch that cannot be inverted
    /// is never applied.
    pub fn compute(patch: &PatchSet, tree: &WorkingTree) -> Result<Self> {
        patch.check_disjoint()?;

        let mut inverse = PatchSet::default();
        let mut prior = BTreeMap::new();

        for diff in &patch.diffs {
            let content = tree.get(&diff.path).ok_or_else(|| EngineError::HunkConflict {
                path: diff.path.clone(),
                line: 0,
                expected: "(file present)".to_string(),
                found: "(file missing)".to_string(),
            })?;
            inverse.diffs.push(diff.inverted());
            prior.insert(diff.path.clone(), Some(content.to_string()));
        }

        for (path, _) in &patch.created {
            inverse.deleted.push(path.clone());
            prior.insert(path.clone(), None);
        }

        for path in &patch.deleted {
            let content = tree.get(path).ok_or_else(|| EngineError::HunkConflict {
                path: path.clone(),
                line: 0,
                expected: "(file present)".to_string(),
                found: "(file missing)".to_string(),
            })?;
            inverse.created.insert(path.clone(), content.to_string());
            prior.insert(path.clone(), Some(content.to_string()));
        }

        Ok(Self { inverse, prior })
    }

    pub fn is_empty(&self) -> bool {
        self.prior.is_empty()
    }

    /// Restore every touched path to its pre-apply state, in memory.
    pub fn restore(&self, tree: &mut WorkingTree) {
        for (path, content) in &self.prior {
            match content {
                Some(text) => tree.insert(path.clone(), text.clone()),
                None => {
                    tree.remove(path);
                }
            }
        }
    }

    /// Restore every touched path on disk under `root`.
    pub fn execute(&self, root: &std::path::Path) -> Result<()> {
        let mut restored = WorkingTree::empty();
        let mut touched = Vec::new();
        for (path, content) in &self.prior {
            if let Some(text) = content {
                restored.insert(path.clone(), text.clone());
            }
            touched.push(path.clone());
        }
        restored.sync(root, &touched)?;
        info!(paths = touched.len(), "rolled back applied changes");
        Ok(())
    }

    /// Human-readable inverse steps for the ROLLBACK protocol section.
    pub fn instructions(&self) -> Vec<String> {
        let mut steps = Vec::new();
        for diff in &self.inverse.diffs {
            let hunks = diff.hunks.len();
            steps.push(format!(
                "revert {} ({} hunk{}, prior content {})",
                diff.path.display(),
                hunks,
                if hunks == 1 { "" } else { "s" },
                self.prior_digest(&diff.path),
            ));
        }
        for path in &self.inverse.deleted {
            steps.push(format!("delete created file {}", path.display()));
        }
        for (path, content) in &self.inverse.created {
            steps.push(format!(
                "restore deleted file {} ({} lines, prior content {})",
                path.display(),
                content.lines().count(),
                self.prior_digest(path),
            ));
        }
        steps
    }

    fn prior_digest(&self, path: &std::path::Path) -> String {
        match self.prior.get(path) {
            Some(Some(content)) => hash_str(content),
            _ => "absent".to_string(),
        }
    }
}

/// Stable content digest (FNV-1a 64-bit) used to label prior file states
/// in rollback instructions.
pub fn hash_str(content: &str) -> String {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in content.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{:016x}", hash)
}
