//! The nine-section wire protocol
//!
//! Every engine result is rendered as nine ordered, always-present
//! sections; an empty section is the literal `None`. Rendering is total.
//! Parsing is used in two places: reading a full reply back from the
//! external planner, and extracting the free-text slot of a
//! clarifying-question answer.

use crate::diff::{parse_unified, render_unified, PatchSet};
use crate::error::{EngineError, Result};
use std::fmt::Write as _;
use std::path::PathBuf;

pub const SECTIONS: [&str; 9] = [
    "PLAN",
    "RISKS",
    "DIFFS",
    "NEW_FILES",
    "DELETED_FILES",
    "COMMANDS",
    "TESTS",
    "NOTES",
    "ROLLBACK",
];

const NEW_FILE_DELIMITER: &str = "=====";

/// One full protocol reply. A `None` field renders as the literal
/// `None`; there is no way to omit a section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub plan: Option<String>,
    pub risks: Option<String>,
    pub diffs: Option<String>,
    pub new_files: Option<String>,
    pub deleted_files: Option<String>,
    pub commands: Option<String>,
    pub tests: Option<String>,
    pub notes: Option<String>,
    pub rollback: Option<String>,
}

impl Reply {
    fn fields(&self) -> [&Option<String>; 9] {
        [
            &self.plan,
            &self.risks,
            &self.diffs,
            &self.new_files,
            &self.deleted_files,
            &self.commands,
            &self.tests,
            &self.notes,
            &self.rollback,
        ]
    }

    fn fields_mut(&mut self) -> [&mut Option<String>; 9] {
        [
            &mut self.plan,
            &mut self.risks,
            &mut self.diffs,
            &mut self.new_files,
            &mut self.deleted_files,
            &mut self.commands,
            &mut self.tests,
            &mut self.notes,
            &mut self.rollback,
        ]
    }

    /// Render all nine sections in fixed order. Total: every reply value
    /// serializes.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, body) in SECTIONS.iter().zip(self.fields()) {
            let _ = writeln!(out, "{}:", name);
            match body {
                Some(text) if !text.trim().is_empty() => {
                    let _ = writeln!(out, "{}", text.trim_end_matches('\n'));
                }
                _ => {
                    let _ = writeln!(out, "None");
                }
            }
            out.push('\n');
        }
        out
    }

    /// Parse a reply. Strict: all nine sections must be present, in
    /// order; anything else is a parse error naming the offending line.
    pub fn parse(text: &str) -> Result<Reply> {
        let mut reply = Reply::default();
        let mut bodies: [Vec<&str>; 9] = Default::default();
        let mut current: Option<usize> = None;

        for (idx, line) in text.lines().enumerate() {
            let header = SECTIONS
                .iter()
                .position(|name| line == format!("{}:", name));
            match header {
                Some(section) => {
                    let expected = current.map(|c| c + 1).unwrap_or(0);
                    if section != expected {
                        return Err(EngineError::parse(
                            idx + 1,
                            format!(
                                "section {} out of order, expected {}",
                                SECTIONS[section], SECTIONS[expected.min(8)]
                            ),
                        ));
                    }
                    current = Some(section);
                }
                None => match current {
                    Some(section) => bodies[section].push(line),
                    None => {
                        if !line.trim().is_empty() {
                            return Err(EngineError::parse(
                                idx + 1,
                                "content before the PLAN section".to_string(),
                            ));
                        }
                    }
                },
            }
        }

        match current {
            Some(8) => {}
            Some(last) => {
                return Err(EngineError::parse(
                    text.lines().count(),
                    format!("missing section {}", SECTIONS[last + 1]),
                ));
            }
            None => {
                return Err(EngineError::parse(1, "missing section PLAN".to_string()));
            }
        }

        for (field, raw_body) in reply.fields_mut().into_iter().zip(bodies) {
            let body = trim_blank_edges(&raw_body).join("\n");
            *field = if body.is_empty() || body == "None" {
                None
            } else {
                Some(body)
            };
        }
        Ok(reply)
    }
}

fn trim_blank_edges<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());
    match (start, end) {
        (Some(s), Some(e)) => lines[s..=e].to_vec(),
        _ => Vec::new(),
    }
}

/// Extract the free-text slot of a clarifying-question answer. Partial:
/// an absent or empty `ANSWER:` slot is rejected, never guessed.
pub fn parse_answer(text: &str) -> Result<String> {
    let mut collected: Option<Vec<&str>> = None;
    for line in text.lines() {
        match &mut collected {
            None => {
                if let Some(rest) = line.strip_prefix("ANSWER:") {
                    collected = Some(vec![rest]);
                }
            }
            Some(lines) => lines.push(line),
        }
    }
    let lines = collected.ok_or_else(|| EngineError::MalformedAnswer {
        reason: "missing ANSWER: slot".to_string(),
    })?;
    let answer = lines.join("\n").trim().to_string();
    if answer.is_empty() {
        return Err(EngineError::MalformedAnswer {
            reason: "ANSWER: slot is empty".to_string(),
        });
    }
    Ok(answer)
}

/// Render a patch set into the DIFFS / NEW_FILES / DELETED_FILES bodies.
pub fn patch_sections(
    patch: &PatchSet,
) -> (Option<String>, Option<String>, Option<String>) {
    let diffs = if patch.diffs.is_empty() {
        None
    } else {
        Some(render_unified(&patch.diffs))
    };

    let new_files = if patch.created.is_empty() {
        None
    } else {
        let mut out = String::new();
        for (path, content) in &patch.created {
            let _ = writeln!(out, "{} {} {}", NEW_FILE_DELIMITER, path.display(), NEW_FILE_DELIMITER);
            out.push_str(content);
            if !content.ends_with('\n') {
                out.push('\n');
            }
        }
        Some(out)
    };

    let deleted = if patch.deleted.is_empty() {
        None
    } else {
        Some(
            patch
                .deleted
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    };

    (diffs, new_files, deleted)
}

/// Rebuild a patch set from the three patch-bearing sections of a reply.
pub fn patch_from_reply(reply: &Reply) -> Result<PatchSet> {
    let mut patch = PatchSet::default();

    if let Some(body) = &reply.diffs {
        patch.diffs = parse_unified(body)?;
    }

    if let Some(body) = &reply.new_files {
        let mut current: Option<(PathBuf, Vec<&str>)> = None;
        for (idx, line) in body.lines().enumerate() {
            if let Some(path) = new_file_label(line) {
                if let Some((prev, lines)) = current.take() {
                    patch.created.insert(prev, finish_content(&lines));
                }
                current = Some((PathBuf::from(path), Vec::new()));
            } else {
                match &mut current {
                    Some((_, lines)) => lines.push(line),
                    None => {
                        return Err(EngineError::parse(
                            idx + 1,
                            "content before the first NEW_FILES path label".to_string(),
                        ));
                    }
                }
            }
        }
        if let Some((prev, lines)) = current.take() {
            patch.created.insert(prev, finish_content(&lines));
        }
    }

    if let Some(body) = &reply.deleted_files {
        patch.deleted = body
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| PathBuf::from(l.trim()))
            .collect();
    }

    patch.check_disjoint()?;
    Ok(patch)
}

fn new_file_label(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(NEW_FILE_DELIMITER)?;
    let rest = rest.strip_suffix(NEW_FILE_DELIMITER)?;
    let path = rest.trim();
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

fn finish_content(lines: &[&str]) -> String {
    let mut content = lines.join("\n");
    content.push('\n');
    content
}
