//! Deterministic risk classification
//!
//! Rule-based severity labels for a patch set. Rules are evaluated
//! high -> medium -> low per file and the first match wins; the overall
//! label is the highest per-file tier, so adding a risky change can never
//! lower an assessment.

use crate::config::ModuleSystem;
use crate::diff::{DiffLine, PatchSet};
use crate::request::Constraints;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// One classified file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskEntry {
    pub path: PathBuf,
    pub level: RiskLevel,
    pub justification: String,
}

/// Severity of a whole patch set. Derived data: recomputed whenever the
/// patch set changes, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskAssessment {
    pub overall: RiskLevel,
    pub justification: String,
    pub entries: Vec<RiskEntry>,
}

impl RiskAssessment {
    /// Render entries for the RISKS protocol section.
    pub fn render(&self) -> String {
        let mut out = format!("[{}] overall: {}", self.overall.as_str(), self.justification);
        for entry in &self.entries {
            out.push_str(&format!(
                "\n[{}] {}: {}",
                entry.level.as_str(),
                entry.path.display(),
                entry.justification
            ));
        }
        out
    }
}

/// Per-file view of what a patch adds and removes
struct ChangeView {
    added: Vec<String>,
    removed: Vec<String>,
    is_deletion: bool,
}

struct Rules {
    export_decl: Regex,
    concurrency: Regex,
    async_flow: Regex,
}

impl Rules {
    fn new(module_system: ModuleSystem) -> Self {
        let export_pattern = match module_system {
            ModuleSystem::Esm => {
                r"^\s*export\s+(?:default\s+)?(?:declare\s+)?(?:async\s+)?(?:function|class|const|let|var|interface|type|enum)\s+([A-Za-z_$][\w$]*)"
            }
            ModuleSystem::Cjs => r"^\s*(?:module\.)?exports\.([A-Za-z_$][\w$]*)\s*=",
        };
        Self {
            export_decl: compile(export_pattern),
            concurrency: compile(
                r"\b(async|await|Promise\.(?:all|allSettled|race|any)|setTimeout|setInterval|queueMicrotask|Worker|worker_threads|child_process|spawn|fork|pipeline|pipe|ReadableStream|WritableStream|createReadStream|createWriteStream|EventEmitter|process\.nextTick)\b",
            ),
            async_flow: compile(r"\b(async|await)\b|\.then\s*\("),
        }
    }

    fn export_name<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.export_decl
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|_| Regex::new("$^").unwrap())
}

const SOURCE_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "cjs", "mts", "cts"];

fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SOURCE_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

/// Classify a patch set against the request constraints. Deterministic
/// and purely rule-based; identical inputs always produce identical
/// assessments.
pub fn classify(
    patch: &PatchSet,
    constraints: &Constraints,
    module_system: ModuleSystem,
) -> RiskAssessment {
    let rules = Rules::new(module_system);
    let views = change_views(patch);
    let relocations = relocated_lines(&views);

    let mut entries = Vec::new();
    for (path, view) in &views {
        entries.push(classify_file(path, view, &rules, relocations.contains_key(path)));
    }

    let overall = entries
        .iter()
        .map(|e| e.level)
        .max()
        .unwrap_or(RiskLevel::Low);
    let mut justification = entries
        .iter()
        .filter(|e| e.level == overall)
        .map(|e| e.justification.clone())
        .next()
        .unwrap_or_else(|| "empty patch set".to_string());

    if overall == RiskLevel::High && !constraints.allow_breaking {
        justification.push_str(" (breaking changes are not permitted by this request)");
    }

    RiskAssessment {
        overall,
        justification,
        entries,
    }
}

fn change_views(patch: &PatchSet) -> BTreeMap<PathBuf, ChangeView> {
    let mut views = BTreeMap::new();
    for diff in &patch.diffs {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        for hunk in &diff.hunks {
            for line in &hunk.lines {
                match line {
                    DiffLine::Add(s) => added.push(s.clone()),
                    DiffLine::Remove(s) => removed.push(s.clone()),
                    DiffLine::Context(_) => {}
                }
            }
        }
        views.insert(
            diff.path.clone(),
            ChangeView {
                added,
                removed,
                is_deletion: false,
            },
        );
    }
    for (path, content) in &patch.created {
        views.insert(
            path.clone(),
            ChangeView {
                added: content.lines().map(|l| l.to_string()).collect(),
                removed: Vec::new(),
                is_deletion: false,
            },
        );
    }
    for path in &patch.deleted {
        views.insert(
            path.clone(),
            ChangeView {
                added: Vec::new(),
                removed: Vec::new(),
                is_deletion: true,
            },
        );
    }
    views
}

/// Non-trivial removed lines that reappear verbatim as additions in a
/// different file, keyed by the destination path.
fn relocated_lines(views: &BTreeMap<PathBuf, ChangeView>) -> BTreeMap<PathBuf, usize> {
    let mut removed_elsewhere: Vec<(&PathBuf, String)> = Vec::new();
    for (path, view) in views {
        for line in &view.removed {
            let trimmed = line.trim();
            if trimmed.len() >= 16 && !trimmed.starts_with("//") {
                removed_elsewhere.push((path, trimmed.to_string()));
            }
        }
    }

    let mut hits: BTreeMap<PathBuf, usize> = BTreeMap::new();
    for (path, view) in views {
        for line in &view.added {
            let trimmed = line.trim();
            if removed_elsewhere
                .iter()
                .any(|(from, removed)| *from != path && removed == trimmed)
            {
                *hits.entry(path.clone()).or_insert(0) += 1;
            }
        }
    }
    hits
}

fn classify_file(
    path: &Path,
    view: &ChangeView,
    rules: &Rules,
    relocated_into: bool,
) -> RiskEntry {
    let entry = |level, justification: String| RiskEntry {
        path: path.to_path_buf(),
        level,
        justification,
    };

    // File deletion: without the content we assume source files carried
    // public exports.
    if view.is_deletion {
        return if is_source_file(path) {
            entry(
                RiskLevel::High,
                "deleted source file, potential public export removal".to_string(),
            )
        } else {
            entry(RiskLevel::Low, "non-source file deletion".to_string())
        };
    }

    let removed_exports: BTreeMap<&str, &str> = view
        .removed
        .iter()
        .filter_map(|l| rules.export_name(l).map(|n| (n, l.as_str())))
        .collect();
    let added_exports: BTreeMap<&str, &str> = view
        .added
        .iter()
        .filter_map(|l| rules.export_name(l).map(|n| (n, l.as_str())))
        .collect();

    // high tier
    for (name, removed_line) in &removed_exports {
        match added_exports.get(name) {
            None => {
                return entry(
                    RiskLevel::High,
                    format!("deleted public export `{}`", name),
                );
            }
            Some(added_line) if added_line.trim() != removed_line.trim() => {
                return entry(
                    RiskLevel::High,
                    format!("public API signature change for `{}`", name),
                );
            }
            Some(_) => {}
        }
    }
    if let Some(line) = view
        .removed
        .iter()
        .find(|l| rules.concurrency.is_match(l))
    {
        return entry(
            RiskLevel::High,
            format!(
                "touches concurrency or streaming control flow ({})",
                line.trim()
            ),
        );
    }

    // medium tier
    if view.added.iter().any(|l| rules.async_flow.is_match(l)) {
        return entry(
            RiskLevel::Medium,
            "introduces a new asynchronous control-flow path".to_string(),
        );
    }
    if let Some(name) = added_exports
        .keys()
        .find(|n| !removed_exports.contains_key(*n))
    {
        return entry(
            RiskLevel::Medium,
            format!("additive public API `{}`", name),
        );
    }
    if relocated_into {
        return entry(
            RiskLevel::Medium,
            "logic relocated from another file".to_string(),
        );
    }

    // low tier
    let cosmetic = view
        .added
        .iter()
        .chain(view.removed.iter())
        .all(|l| {
            let t = l.trim();
            t.is_empty() || t.starts_with("//") || t.starts_with("/*") || t.starts_with('*')
        });
    if cosmetic {
        entry(
            RiskLevel::Low,
            "comment or formatting change only".to_string(),
        )
    } else {
        entry(RiskLevel::Low, "internal-only change".to_string())
    }
}
