//! Unified diff model
//!
//! Parsing, rendering, strict application, and inversion of patch sets.
//! Application is exact: a hunk's context and removed lines must match the
//! target content at the recorded offset. There is no fuzzy matching; an
//! off-by-one is a conflict, not a guess. That keeps every applied patch
//! reviewable and mechanically reversible.

use crate::error::{EngineError, Result};
use crate::tree::WorkingTree;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

impl DiffLine {
    pub fn content(&self) -> &str {
        match self {
            DiffLine::Context(s) => s,
            DiffLine::Add(s) => s,
            DiffLine::Remove(s) => s,
        }
    }
}

/// A hunk in a unified diff. Line positions are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// Lines this hunk expects to find in the pre-patch file.
    fn expected_old(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Context(_) | DiffLine::Remove(_)))
            .map(|l| l.content())
            .collect()
    }

    /// Lines this hunk produces in the post-patch file.
    fn replacement(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Context(_) | DiffLine::Add(_)))
            .map(|l| l.content().to_string())
            .collect()
    }

    /// Additions and removals in this hunk
    pub fn summary(&self) -> (usize, usize) {
        let adds = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Add(_)))
            .count();
        let removes = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Remove(_)))
            .count();
        (adds, removes)
    }

    /// The same edit with add and remove swapped; applies to the patched
    /// file and restores the original.
    pub fn inverted(&self) -> DiffHunk {
        DiffHunk {
            old_start: self.new_start,
            old_count: self.new_count,
            new_start: self.old_start,
            new_count: self.old_count,
            lines: self
                .lines
                .iter()
                .map(|l| match l {
                    DiffLine::Context(s) => DiffLine::Context(s.clone()),
                    DiffLine::Add(s) => DiffLine::Remove(s.clone()),
                    DiffLine::Remove(s) => DiffLine::Add(s.clone()),
                })
                .collect(),
        }
    }
}

/// All hunks against one modified file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: PathBuf,
    pub hunks: Vec<DiffHunk>,
}

impl FileDiff {
    /// Check the structural invariants: hunks ordered by position,
    /// non-overlapping, and with counts that match their lines.
    pub fn validate(&self) -> Result<()> {
        if self.hunks.is_empty() {
            return Err(EngineError::parse(
                0,
                format!("no hunks for {}", self.path.display()),
            ));
        }
        let mut prev_end = 0usize;
        for hunk in &self.hunks {
            if hunk.old_count != hunk.expected_old().len()
                || hunk.new_count != hunk.replacement().len()
            {
                return Err(EngineError::parse(
                    hunk.old_start,
                    format!(
                        "hunk counts do not match lines in {}",
                        self.path.display()
                    ),
                ));
            }
            if hunk.old_start < prev_end {
                return Err(EngineError::parse(
                    hunk.old_start,
                    format!(
                        "hunks out of order or overlapping in {}",
                        self.path.display()
                    ),
                ));
            }
            prev_end = hunk.old_start + hunk.old_count;
        }
        Ok(())
    }

    /// Apply this diff to `content`, verifying every hunk before any
    /// mutation so a conflict leaves nothing half-patched.
    pub fn apply_to(&self, content: &str) -> Result<String> {
        self.validate()?;
        let lines: Vec<&str> = content.lines().collect();

        for hunk in &self.hunks {
            let start = hunk.old_start.saturating_sub(1);
            for (offset, expected) in hunk.expected_old().iter().enumerate() {
                match lines.get(start + offset) {
                    Some(actual) if actual == expected => {}
                    other => {
                        return Err(EngineError::HunkConflict {
                            path: self.path.clone(),
                            line: start + offset + 1,
                            expected: (*expected).to_string(),
                            found: other.map(|s| s.to_string()).unwrap_or_else(|| {
                                "(end of file)".to_string()
                            }),
                        });
                    }
                }
            }
        }

        // Splice in reverse so earlier hunk positions stay valid.
        let mut out: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        for hunk in self.hunks.iter().rev() {
            let start = hunk.old_start.saturating_sub(1);
            let remove = hunk.expected_old().len();
            out.splice(start..start + remove, hunk.replacement());
        }

        let mut text = out.join("\n");
        if !text.is_empty() && (content.ends_with('\n') || content.is_empty()) {
            text.push('\n');
        }
        Ok(text)
    }

    /// The inverse diff: applied to the patched file, restores the
    /// original.
    pub fn inverted(&self) -> FileDiff {
        FileDiff {
            path: self.path.clone(),
            hunks: self.hunks.iter().map(DiffHunk::inverted).collect(),
        }
    }

    /// A single-hunk diff replacing the whole of `old` with `new`. Used
    /// to fold tool-driven rewrites (e.g. a formatter) back into a patch.
    pub fn replacing(path: PathBuf, old: &str, new: &str) -> FileDiff {
        let removed: Vec<DiffLine> = old
            .lines()
            .map(|l| DiffLine::Remove(l.to_string()))
            .collect();
        let added: Vec<DiffLine> = new.lines().map(|l| DiffLine::Add(l.to_string())).collect();
        let old_count = removed.len();
        let new_count = added.len();
        let mut lines = removed;
        lines.extend(added);
        FileDiff {
            path,
            hunks: vec![DiffHunk {
                old_start: 1,
                old_count,
                new_start: 1,
                new_count,
                lines,
            }],
        }
    }
}

/// The complete set of changes proposed for one iteration: modified
/// files as hunks, created files as full content, deleted files as paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    pub diffs: Vec<FileDiff>,
    pub created: BTreeMap<PathBuf, String>,
    pub deleted: Vec<PathBuf>,
}

impl PatchSet {
    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty() && self.created.is_empty() && self.deleted.is_empty()
    }

    /// Every path this patch touches, in a stable order.
    pub fn touched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.diffs.iter().map(|d| d.path.clone()).collect();
        paths.extend(self.created.keys().cloned());
        paths.extend(self.deleted.iter().cloned());
        paths.sort();
        paths.dedup();
        paths
    }

    /// Total additions and removals across the patch
    pub fn stats(&self) -> (usize, usize) {
        let mut adds = 0;
        let mut removes = 0;
        for diff in &self.diffs {
            for hunk in &diff.hunks {
                let (a, r) = hunk.summary();
                adds += a;
                removes += r;
            }
        }
        adds += self.created.values().map(|c| c.lines().count()).sum::<usize>();
        removes += self.deleted.len();
        (adds, removes)
    }

    /// No path may appear in more than one of {modified, created,
    /// deleted}.
    pub fn check_disjoint(&self) -> Result<()> {
        let mut seen: BTreeSet<&Path> = BTreeSet::new();
        let modified = self.diffs.iter().map(|d| d.path.as_path());
        let created = self.created.keys().map(|p| p.as_path());
        let deleted = self.deleted.iter().map(|p| p.as_path());
        for path in modified.chain(created).chain(deleted) {
            if !seen.insert(path) {
                return Err(EngineError::PathCollision {
                    path: path.to_path_buf(),
                    detail: "path appears in more than one change set".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Apply the patch to a tree snapshot, producing a new snapshot.
    /// Pure: a conflict anywhere leaves the input untouched.
    pub fn apply(&self, tree: &WorkingTree) -> Result<WorkingTree> {
        self.check_disjoint()?;
        let mut next = tree.clone();

        for diff in &self.diffs {
            let content = tree.get(&diff.path).ok_or_else(|| EngineError::HunkConflict {
                path: diff.path.clone(),
                line: diff.hunks.first().map(|h| h.old_start).unwrap_or(0),
                expected: "(file present)".to_string(),
                found: "(file missing)".to_string(),
            })?;
            next.insert(diff.path.clone(), diff.apply_to(content)?);
        }

        for path in &self.deleted {
            if next.remove(path).is_none() {
                return Err(EngineError::HunkConflict {
                    path: path.clone(),
                    line: 0,
                    expected: "(file present)".to_string(),
                    found: "(file missing)".to_string(),
                });
            }
        }

        for (path, content) in &self.created {
            if next.contains(path) {
                return Err(EngineError::PathCollision {
                    path: path.clone(),
                    detail: "creation target already exists".to_string(),
                });
            }
            next.insert(path.clone(), content.clone());
        }

        Ok(next)
    }
}

/// Parse unified-diff text into per-file diffs. Strict: headers and hunk
/// counts must be well-formed, and errors carry the offending line.
pub fn parse_unified(text: &str) -> Result<Vec<FileDiff>> {
    let lines: Vec<&str> = text.lines().collect();
    let mut diffs = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if lines[i].trim().is_empty() {
            i += 1;
            continue;
        }
        let old_header = lines[i];
        if !old_header.starts_with("--- ") {
            return Err(EngineError::parse(
                i + 1,
                format!("expected '--- path' header, found {:?}", old_header),
            ));
        }
        let old_path = strip_header_path(&old_header[4..]);
        i += 1;

        let new_header = lines.get(i).copied().unwrap_or("");
        if !new_header.starts_with("+++ ") {
            return Err(EngineError::parse(
                i + 1,
                format!("expected '+++ path' header, found {:?}", new_header),
            ));
        }
        let new_path = strip_header_path(&new_header[4..]);
        i += 1;

        let path = if new_path == "/dev/null" { old_path } else { new_path };
        let mut hunks = Vec::new();
        while i < lines.len() && lines[i].starts_with("@@") {
            hunks.push(parse_hunk(&lines, &mut i)?);
        }
        if hunks.is_empty() {
            return Err(EngineError::parse(i + 1, format!("no hunks for {}", path)));
        }

        let diff = FileDiff {
            path: PathBuf::from(path),
            hunks,
        };
        diff.validate()?;
        diffs.push(diff);
    }

    Ok(diffs)
}

/// Drop `a/`/`b/` prefixes and timestamp suffixes from a header path.
fn strip_header_path(raw: &str) -> &str {
    let raw = raw.trim_end();
    let raw = match raw.split_once('\t') {
        Some((path, _)) => path,
        None => raw,
    };
    raw.strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw)
}

fn parse_hunk(lines: &[&str], idx: &mut usize) -> Result<DiffHunk> {
    let header_line = *idx + 1;
    let header = lines[*idx];
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 3 || parts[0] != "@@" {
        return Err(EngineError::parse(
            header_line,
            format!("invalid hunk header: {}", header),
        ));
    }
    let (old_start, old_count) = parse_range(parts[1].trim_start_matches('-'), header_line)?;
    let (new_start, new_count) = parse_range(parts[2].trim_start_matches('+'), header_line)?;
    *idx += 1;

    // Consume exactly the lines the header declares.
    let mut diff_lines = Vec::new();
    let mut old_seen = 0usize;
    let mut new_seen = 0usize;
    while old_seen < old_count || new_seen < new_count {
        let line = lines.get(*idx).copied().ok_or_else(|| {
            EngineError::parse(*idx, "hunk shorter than its header declares".to_string())
        })?;
        if line.starts_with("\\ No newline") {
            *idx += 1;
            continue;
        }
        if let Some(rest) = line.strip_prefix('+') {
            diff_lines.push(DiffLine::Add(rest.to_string()));
            new_seen += 1;
        } else if let Some(rest) = line.strip_prefix('-') {
            diff_lines.push(DiffLine::Remove(rest.to_string()));
            old_seen += 1;
        } else if let Some(rest) = line.strip_prefix(' ') {
            diff_lines.push(DiffLine::Context(rest.to_string()));
            old_seen += 1;
            new_seen += 1;
        } else if line.is_empty() {
            diff_lines.push(DiffLine::Context(String::new()));
            old_seen += 1;
            new_seen += 1;
        } else {
            return Err(EngineError::parse(
                *idx + 1,
                format!("unexpected line inside hunk: {:?}", line),
            ));
        }
        *idx += 1;
    }

    Ok(DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: diff_lines,
    })
}

/// Parse a range like "10,5" or "10" into (start, count)
fn parse_range(s: &str, line: usize) -> Result<(usize, usize)> {
    let parse_num = |t: &str| {
        t.parse::<usize>()
            .map_err(|_| EngineError::parse(line, format!("invalid line number: {}", s)))
    };
    match s.split_once(',') {
        Some((start, count)) => Ok((parse_num(start)?, parse_num(count)?)),
        None => Ok((parse_num(s)?, 1)),
    }
}

/// Render per-file diffs as unified-diff text, line-feed endings only.
pub fn render_unified(diffs: &[FileDiff]) -> String {
    let mut out = String::new();
    for diff in diffs {
        out.push_str(&format!("--- {}\n", diff.path.display()));
        out.push_str(&format!("+++ {}\n", diff.path.display()));
        for hunk in &diff.hunks {
            out.push_str(&format!(
                "@@ -{},{} +{},{} @@\n",
                hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count
            ));
            for line in &hunk.lines {
                match line {
                    DiffLine::Context(s) => out.push_str(&format!(" {}\n", s)),
                    DiffLine::Add(s) => out.push_str(&format!("+{}\n", s)),
                    DiffLine::Remove(s) => out.push_str(&format!("-{}\n", s)),
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_patch() -> PatchSet {
        let text = r#"--- src/example.ts
+++ src/example.ts
@@ -1,4 +1,5 @@
 function hello() {
-  console.log("old");
+  console.log("new");
+  console.log("extra");
   return true;
 }
"#;
        PatchSet {
            diffs: parse_unified(text).unwrap(),
            ..Default::default()
        }
    }

    fn tree_with(path: &str, content: &str) -> WorkingTree {
        let mut tree = WorkingTree::empty();
        tree.insert(PathBuf::from(path), content.to_string());
        tree
    }

    #[test]
    fn test_parse_simple_diff() {
        let patch = simple_patch();
        assert_eq!(patch.diffs.len(), 1);
        assert_eq!(patch.diffs[0].path, PathBuf::from("src/example.ts"));
        assert_eq!(patch.diffs[0].hunks.len(), 1);
        assert_eq!(patch.stats(), (2, 1));
    }

    #[test]
    fn test_render_parse_round_trip() {
        let patch = simple_patch();
        let rendered = render_unified(&patch.diffs);
        let reparsed = parse_unified(&rendered).unwrap();
        assert_eq!(reparsed, patch.diffs);
    }

    #[test]
    fn test_apply_exact() {
        let tree = tree_with(
            "src/example.ts",
            "function hello() {\n  console.log(\"old\");\n  return true;\n}\n",
        );
        let patched = simple_patch().apply(&tree).unwrap();
        let content = patched.get(Path::new("src/example.ts")).unwrap();
        assert!(content.contains("console.log(\"new\")"));
        assert!(content.contains("console.log(\"extra\")"));
        assert!(!content.contains("console.log(\"old\")"));
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn test_apply_conflict_on_drifted_context() {
        // The tree was edited externally; the recorded context no longer
        // matches, so apply must conflict and leave the input untouched.
        let tree = tree_with(
            "src/example.ts",
            "function hello() {\n  console.log(\"edited\");\n  return true;\n}\n",
        );
        let err = simple_patch().apply(&tree).unwrap_err();
        match err {
            EngineError::HunkConflict { line, .. } => assert_eq!(line, 2),
            other => panic!("expected HunkConflict, got {:?}", other),
        }
        assert!(tree
            .get(Path::new("src/example.ts"))
            .unwrap()
            .contains("edited"));
    }

    #[test]
    fn test_apply_missing_file_conflicts() {
        let tree = WorkingTree::empty();
        let err = simple_patch().apply(&tree).unwrap_err();
        assert!(matches!(err, EngineError::HunkConflict { .. }));
    }

    #[test]
    fn test_path_collision_detected() {
        let mut patch = simple_patch();
        patch.deleted.push(PathBuf::from("src/example.ts"));
        assert!(matches!(
            patch.check_disjoint().unwrap_err(),
            EngineError::PathCollision { .. }
        ));
    }

    #[test]
    fn test_create_over_existing_collides() {
        let tree = tree_with("src/new.ts", "already here\n");
        let mut patch = PatchSet::default();
        patch
            .created
            .insert(PathBuf::from("src/new.ts"), "fresh\n".to_string());
        assert!(matches!(
            patch.apply(&tree).unwrap_err(),
            EngineError::PathCollision { .. }
        ));
    }

    #[test]
    fn test_overlapping_hunks_rejected() {
        let text = r#"--- a.ts
+++ a.ts
@@ -1,2 +1,2 @@
 one
-two
+TWO
@@ -2,1 +2,1 @@
-two
+deux
"#;
        assert!(matches!(
            parse_unified(text).unwrap_err(),
            EngineError::ParseError { .. }
        ));
    }

    #[test]
    fn test_count_mismatch_rejected() {
        let text = "--- a.ts\n+++ a.ts\n@@ -1,3 +1,1 @@\n-one\n";
        assert!(matches!(
            parse_unified(text).unwrap_err(),
            EngineError::ParseError { .. }
        ));
    }

    #[test]
    fn test_inverted_hunk_round_trip() {
        let original = "function hello() {\n  console.log(\"old\");\n  return true;\n}\n";
        let tree = tree_with("src/example.ts", original);
        let patch = simple_patch();

        let patched = patch.apply(&tree).unwrap();
        let inverse = PatchSet {
            diffs: patch.diffs.iter().map(FileDiff::inverted).collect(),
            ..Default::default()
        };
        let restored = inverse.apply(&patched).unwrap();
        assert_eq!(restored.get(Path::new("src/example.ts")), Some(original));
    }

    #[test]
    fn test_replacing_diff_applies() {
        let old = "a\nb\n";
        let new = "a\nB\nc\n";
        let diff = FileDiff::replacing(PathBuf::from("x.ts"), old, new);
        assert_eq!(diff.apply_to(old).unwrap(), new);
    }

    #[test]
    fn test_preserves_missing_trailing_newline() {
        let old = "one\ntwo";
        let text = "--- x.ts\n+++ x.ts\n@@ -1,1 +1,1 @@\n-one\n+ONE\n";
        let diffs = parse_unified(text).unwrap();
        let out = diffs[0].apply_to(old).unwrap();
        assert_eq!(out, "ONE\ntwo");
    }
}
