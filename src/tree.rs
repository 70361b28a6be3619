//! Working-tree snapshot
//!
//! The file system view the diff model operates on: an in-memory map of
//! repo-relative paths to file contents. Patches apply to a snapshot and
//! produce a new snapshot; only the phases that own the tree write the
//! result back to disk.

use crate::error::{EngineError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Directories never loaded into a snapshot.
const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    "node_modules",
    "target",
    "dist",
    "build",
    ".reforge",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingTree {
    files: BTreeMap<PathBuf, String>,
}

impl WorkingTree {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot all text files under `root`. Binary (non-UTF-8) files are
    /// skipped; they are outside what a refactor patch may touch.
    pub fn load(root: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !(e.file_type().is_dir() && IGNORED_DIRS.contains(&name.as_ref()))
        });

        for entry in walker {
            let entry = entry.map_err(|e| EngineError::Io {
                context: format!("walking {}", root.display()),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let bytes = fs::read(entry.path())
                .map_err(|e| EngineError::io(format!("reading {}", entry.path().display()), e))?;
            let Ok(content) = String::from_utf8(bytes) else {
                continue;
            };
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_path_buf();
            files.insert(relative, content);
        }

        debug!(files = files.len(), root = %root.display(), "tree snapshot loaded");
        Ok(Self { files })
    }

    pub fn get(&self, path: &Path) -> Option<&str> {
        self.files.get(path).map(|s| s.as_str())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn insert(&mut self, path: PathBuf, content: String) {
        self.files.insert(path, content);
    }

    pub fn remove(&mut self, path: &Path) -> Option<String> {
        self.files.remove(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.keys()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Paths whose content differs between the two snapshots, including
    /// paths present in only one of them.
    pub fn diff_paths(&self, other: &WorkingTree) -> Vec<PathBuf> {
        let mut changed = Vec::new();
        for (path, content) in &self.files {
            if other.get(path) != Some(content.as_str()) {
                changed.push(path.clone());
            }
        }
        for path in other.files.keys() {
            if !self.files.contains_key(path) {
                changed.push(path.clone());
            }
        }
        changed.sort();
        changed.dedup();
        changed
    }

    /// Write the snapshot state of `touched` paths back to disk: present
    /// paths are written, absent paths are removed.
    pub fn sync(&self, root: &Path, touched: &[PathBuf]) -> Result<()> {
        for rel in touched {
            let abs = resolve_in_root(root, rel)?;
            match self.files.get(rel) {
                Some(content) => {
                    if let Some(parent) = abs.parent() {
                        fs::create_dir_all(parent).map_err(|e| {
                            EngineError::io(format!("creating {}", parent.display()), e)
                        })?;
                    }
                    fs::write(&abs, content)
                        .map_err(|e| EngineError::io(format!("writing {}", abs.display()), e))?;
                }
                None => {
                    if abs.exists() {
                        fs::remove_file(&abs).map_err(|e| {
                            EngineError::io(format!("removing {}", abs.display()), e)
                        })?;
                    }
                }
            }
        }
        debug!(paths = touched.len(), "tree synced to disk");
        Ok(())
    }
}

/// Resolve a repo-relative path inside `root`, rejecting absolute paths
/// and parent traversal so a patch can never write outside the tree.
pub fn resolve_in_root(root: &Path, candidate: &Path) -> Result<PathBuf> {
    if candidate.as_os_str().is_empty() {
        return Err(EngineError::parse(0, "empty path in patch"));
    }
    if candidate.is_absolute() {
        return Err(EngineError::parse(
            0,
            format!("absolute path not allowed: {}", candidate.display()),
        ));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(EngineError::parse(
            0,
            format!("parent traversal not allowed: {}", candidate.display()),
        ));
    }
    Ok(root.join(candidate))
}
