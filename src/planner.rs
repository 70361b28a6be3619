//! The planning seam
//!
//! The engine never generates code itself; it asks an external planner
//! for patch proposals and feeds validation failures back into the next
//! request. `Planner` is the seam; `CommandPlanner` is the stock
//! implementation that talks the nine-section protocol with a
//! subprocess over stdio.

use crate::diff::PatchSet;
use crate::error::{EngineError, Result};
use crate::phase::IterationRecord;
use crate::protocol::{patch_from_reply, Reply};
use crate::request::RefactorRequest;
use crate::tree::WorkingTree;
use crate::validate::{run_shell, ValidationResult};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// One proposed patch attempt from the planner
#[derive(Debug, Clone)]
pub struct PatchProposal {
    /// Step-by-step plan text for the PLAN section
    pub plan: String,
    pub patch: PatchSet,
    /// Planner-stated testing notes, if any
    pub tests: Option<String>,
}

/// Self-critique verdict over an otherwise green patch
#[derive(Debug, Clone)]
pub struct Critique {
    pub approved: bool,
    pub notes: Option<String>,
}

impl Critique {
    pub fn approve() -> Self {
        Self {
            approved: true,
            notes: None,
        }
    }
}

/// External planning service. Implementations are free to be an LLM
/// bridge, a rules engine, or a test double; the engine only sees
/// proposals.
pub trait Planner {
    /// Produce a proposal for the request. On iterations after a failed
    /// attempt, `failure` carries the previous record so the planner can
    /// fold the validation output into its next try.
    fn propose(
        &mut self,
        request: &RefactorRequest,
        tree: &WorkingTree,
        clarifications: &[(String, String)],
        failure: Option<&IterationRecord>,
    ) -> Result<PatchProposal>;

    /// Review a green patch for hidden behavior changes before it is
    /// accepted. Default: approve.
    fn critique(
        &mut self,
        _proposal: &PatchProposal,
        _results: &[ValidationResult],
    ) -> Result<Critique> {
        Ok(Critique::approve())
    }
}

/// Planner backed by an external command speaking the protocol on
/// stdio: request context in, nine-section reply out.
pub struct CommandPlanner {
    command: String,
    root: PathBuf,
    timeout: Duration,
}

impl CommandPlanner {
    pub fn new(command: String, root: PathBuf, timeout: Duration) -> Self {
        Self {
            command,
            root,
            timeout,
        }
    }
}

impl Planner for CommandPlanner {
    fn propose(
        &mut self,
        request: &RefactorRequest,
        tree: &WorkingTree,
        clarifications: &[(String, String)],
        failure: Option<&IterationRecord>,
    ) -> Result<PatchProposal> {
        let prompt = render_planning_request(request, tree, clarifications, failure);
        debug!(bytes = prompt.len(), "sending planning request");

        let output = run_shell(&self.command, &self.root, Some(&prompt), self.timeout)
            .map_err(EngineError::PlannerFailed)?;
        if output.timed_out {
            return Err(EngineError::Timeout {
                command: self.command.clone(),
                seconds: self.timeout.as_secs(),
            });
        }
        let exit_ok = output.status.map(|s| s.success()).unwrap_or(false);
        if !exit_ok {
            return Err(EngineError::PlannerFailed(format!(
                "planner exited non-zero: {}",
                crate::validate::truncate_output(&output.stderr, 400)
            )));
        }

        let reply = Reply::parse(&output.stdout)?;
        let patch = patch_from_reply(&reply)?;
        if patch.is_empty() {
            return Err(EngineError::PlannerFailed(
                "planner returned an empty patch set".to_string(),
            ));
        }
        info!(files = patch.touched_paths().len(), "planner proposal received");

        Ok(PatchProposal {
            plan: reply
                .plan
                .unwrap_or_else(|| "(planner provided no plan text)".to_string()),
            patch,
            tests: reply.tests,
        })
    }
}

/// Render the planning request the subprocess receives on stdin.
pub fn render_planning_request(
    request: &RefactorRequest,
    tree: &WorkingTree,
    clarifications: &[(String, String)],
    failure: Option<&IterationRecord>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("GOAL:\n{}\n\n", request.goal.trim()));

    out.push_str("SCOPE:\n");
    if request.scope.is_empty() {
        out.push_str("entire tree\n\n");
    } else {
        out.push_str(&request.scope.join("\n"));
        out.push_str("\n\n");
    }

    out.push_str(&format!(
        "CONSTRAINTS:\nno_new_dependencies={}\nbehavior_preserving={}\nallow_breaking={}\n\n",
        request.constraints.no_new_dependencies,
        request.constraints.behavior_preserving,
        request.constraints.allow_breaking,
    ));

    if !clarifications.is_empty() {
        out.push_str("CLARIFICATIONS:\n");
        for (question, answer) in clarifications {
            out.push_str(&format!("Q: {}\nA: {}\n", question, answer));
        }
        out.push('\n');
    }

    if let Some(record) = failure {
        out.push_str(&format!(
            "PREVIOUS_ATTEMPT:\niteration {} {}\n",
            record.seq,
            record.outcome.as_str()
        ));
        for result in &record.results {
            out.push_str(&format!(
                "[{}] {} ({})\n{}\n",
                result.status.as_str(),
                result.command,
                result.category.as_str(),
                result.output,
            ));
        }
        out.push('\n');
    }

    // Scoped files in full, the rest as a listing, so the planner sees
    // what it may touch without the whole tree in its context.
    let scoped = request.compile_scope().ok();
    out.push_str("FILES:\n");
    for path in tree.paths() {
        let in_scope = match &scoped {
            Some(set) if !request.scope.is_empty() => set.is_match(path),
            _ => false,
        };
        if in_scope {
            if let Some(content) = tree.get(path) {
                out.push_str(&format!("===== {} =====\n{}", path.display(), content));
                if !content.ends_with('\n') {
                    out.push('\n');
                }
            }
        } else {
            out.push_str(&format!("{}\n", path.display()));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Constraints;
    use std::path::PathBuf;

    fn request() -> RefactorRequest {
        RefactorRequest::new(
            "inline the helper".to_string(),
            vec!["src/*.ts".to_string()],
            Constraints {
                no_new_dependencies: true,
                behavior_preserving: true,
                allow_breaking: false,
            },
        )
    }

    fn tree() -> WorkingTree {
        let mut tree = WorkingTree::empty();
        tree.insert(PathBuf::from("src/a.ts"), "let a = 1;\n".to_string());
        tree.insert(PathBuf::from("README.md"), "docs\n".to_string());
        tree
    }

    #[test]
    fn test_prompt_inlines_scoped_files_only() {
        let prompt = render_planning_request(&request(), &tree(), &[], None);
        assert!(prompt.contains("===== src/a.ts =====\nlet a = 1;"));
        assert!(prompt.contains("README.md"));
        assert!(!prompt.contains("===== README.md"));
    }

    #[test]
    fn test_command_planner_round_trip() {
        // A planner that echoes a fixed protocol reply.
        let reply = Reply {
            plan: Some("1. bump x".to_string()),
            diffs: Some(
                "--- src/a.ts\n+++ src/a.ts\n@@ -1,1 +1,1 @@\n-let a = 1;\n+let a = 2;"
                    .to_string(),
            ),
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("planner.txt");
        std::fs::write(&script, reply.render()).unwrap();

        let mut planner = CommandPlanner::new(
            format!("cat {}", script.display()),
            dir.path().to_path_buf(),
            Duration::from_secs(5),
        );
        let proposal = planner.propose(&request(), &tree(), &[], None).unwrap();
        assert_eq!(proposal.plan, "1. bump x");
        assert_eq!(proposal.patch.diffs.len(), 1);
    }

    #[test]
    fn test_command_planner_surfaces_failure() {
        let mut planner = CommandPlanner::new(
            "exit 7".to_string(),
            std::env::current_dir().unwrap(),
            Duration::from_secs(5),
        );
        assert!(matches!(
            planner.propose(&request(), &tree(), &[], None).unwrap_err(),
            EngineError::PlannerFailed(_)
        ));
    }
}
