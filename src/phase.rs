//! Phase state machine
//!
//! Drives one refactor request through
//! Intake -> Analyze -> Plan -> Patch -> Validate -> Critique and either
//! Finalize, Iterate, or Abort. The engine processes one request at a
//! time, end to end; only the patching and validating phases touch the
//! working tree, and an abort always restores the pre-request state
//! before control returns.

use crate::config::EngineConfig;
use crate::diff::{FileDiff, PatchSet};
use crate::error::{EngineError, Result};
use crate::planner::{PatchProposal, Planner};
use crate::protocol::{self, patch_sections, Reply};
use crate::request::RefactorRequest;
use crate::risk::{classify, RiskAssessment};
use crate::rollback::RollbackPlan;
use crate::tree::WorkingTree;
use crate::validate::{run_plan, CheckCategory, ValidationPlan, ValidationResult};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Intake,
    Analyzing,
    /// Suspended awaiting an external answer. No timeout; leaving this
    /// state takes an answer or an explicit cancel.
    BlockedOnClarification {
        question: String,
    },
    Planning,
    Patching,
    Validating,
    Critiquing,
    Iterating,
    Finalized,
    Aborted {
        reason: String,
    },
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Intake => "intake",
            Phase::Analyzing => "analyzing",
            Phase::BlockedOnClarification { .. } => "blocked-on-clarification",
            Phase::Planning => "planning",
            Phase::Patching => "patching",
            Phase::Validating => "validating",
            Phase::Critiquing => "critiquing",
            Phase::Iterating => "iterating",
            Phase::Finalized => "finalized",
            Phase::Aborted { .. } => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Finalized | Phase::Aborted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Passed,
    Failed,
    BlockedOnClarification,
}

impl IterationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationOutcome::Passed => "passed",
            IterationOutcome::Failed => "failed",
            IterationOutcome::BlockedOnClarification => "blocked-on-clarification",
        }
    }
}

/// Immutable record of one plan->patch->validate attempt
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub seq: usize,
    pub patch: PatchSet,
    pub risk: RiskAssessment,
    pub results: Vec<ValidationResult>,
    pub outcome: IterationOutcome,
    pub recorded_at: DateTime<Utc>,
}

pub struct Engine<P: Planner> {
    config: EngineConfig,
    request: RefactorRequest,
    root: PathBuf,
    /// Pre-apply snapshot; proposals are always planned against this.
    tree: WorkingTree,
    plan: ValidationPlan,
    planner: P,
    phase: Phase,
    history: Vec<IterationRecord>,
    clarifications: Vec<(String, String)>,
    proposal: Option<PatchProposal>,
    pending_risk: Option<RiskAssessment>,
    pending_results: Option<Vec<ValidationResult>>,
    patched: Option<WorkingTree>,
    rollback: Option<RollbackPlan>,
    applied: bool,
    reverted: bool,
    accepted: Option<usize>,
    critique_notes: Option<String>,
}

impl<P: Planner> Engine<P> {
    pub fn new(
        root: PathBuf,
        request: RefactorRequest,
        config: EngineConfig,
        planner: P,
    ) -> Result<Self> {
        let tree = WorkingTree::load(&root)?;
        let plan = ValidationPlan::assemble(&config, &root);
        info!(
            request = %request.id,
            files = tree.len(),
            checks = plan.commands.len(),
            "request accepted"
        );
        Ok(Self {
            config,
            request,
            root,
            tree,
            plan,
            planner,
            phase: Phase::Intake,
            history: Vec::new(),
            clarifications: Vec::new(),
            proposal: None,
            pending_risk: None,
            pending_results: None,
            patched: None,
            rollback: None,
            applied: false,
            reverted: false,
            accepted: None,
            critique_notes: None,
        })
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    pub fn planner(&self) -> &P {
        &self.planner
    }

    /// Drive the request until it finalizes, aborts, or suspends on a
    /// clarifying question.
    pub fn run(&mut self) -> Result<&Phase> {
        loop {
            match &self.phase {
                Phase::Finalized
                | Phase::Aborted { .. }
                | Phase::BlockedOnClarification { .. } => return Ok(&self.phase),
                _ => self.step()?,
            }
        }
    }

    /// Execute exactly one transition.
    pub fn step(&mut self) -> Result<()> {
        let from = self.phase.name();
        match self.phase.clone() {
            Phase::Intake => self.phase = Phase::Analyzing,
            Phase::Analyzing => self.step_analyzing()?,
            Phase::Planning => self.step_planning()?,
            Phase::Patching => self.step_patching()?,
            Phase::Validating => self.step_validating(),
            Phase::Critiquing => self.step_critiquing()?,
            Phase::Iterating => {
                self.revert()?;
                self.proposal = None;
                self.phase = Phase::Planning;
            }
            Phase::BlockedOnClarification { .. }
            | Phase::Finalized
            | Phase::Aborted { .. } => {}
        }
        if from != self.phase.name() {
            info!(from, to = self.phase.name(), "phase transition");
        }
        Ok(())
    }

    /// Feed the answer to the pending clarifying question. The answer
    /// text must carry the protocol's `ANSWER:` slot.
    pub fn answer(&mut self, text: &str) -> Result<()> {
        let Phase::BlockedOnClarification { question } = &self.phase else {
            return Err(EngineError::MalformedAnswer {
                reason: "engine is not awaiting clarification".to_string(),
            });
        };
        let question = question.clone();
        let answer = protocol::parse_answer(text)?;
        self.clarifications.push((question, answer));
        self.phase = Phase::Analyzing;
        Ok(())
    }

    /// Explicitly cancel a suspended request.
    pub fn cancel(&mut self) -> Result<()> {
        if matches!(self.phase, Phase::BlockedOnClarification { .. }) {
            self.abort("clarification canceled by caller".to_string())?;
        }
        Ok(())
    }

    fn step_analyzing(&mut self) -> Result<()> {
        let answered: Vec<String> =
            self.clarifications.iter().map(|(q, _)| q.clone()).collect();
        match self.request.ambiguity(&self.tree, &answered)? {
            Some(question) => {
                info!(%question, "request is ambiguous, suspending");
                self.phase = Phase::BlockedOnClarification { question };
            }
            None => self.phase = Phase::Planning,
        }
        Ok(())
    }

    fn step_planning(&mut self) -> Result<()> {
        let failure = self
            .history
            .iter()
            .rev()
            .find(|r| r.outcome == IterationOutcome::Failed);
        match self
            .planner
            .propose(&self.request, &self.tree, &self.clarifications, failure)
        {
            Ok(proposal) => {
                self.proposal = Some(proposal);
                self.phase = Phase::Patching;
                Ok(())
            }
            Err(EngineError::AmbiguousRequest { question }) => {
                self.push_record(
                    PatchSet::default(),
                    classify(
                        &PatchSet::default(),
                        &self.request.constraints,
                        self.config.module_system,
                    ),
                    Vec::new(),
                    IterationOutcome::BlockedOnClarification,
                );
                self.phase = Phase::BlockedOnClarification { question };
                Ok(())
            }
            Err(e) => self.abort(e.to_string()),
        }
    }

    fn step_patching(&mut self) -> Result<()> {
        let Some(proposal) = self.proposal.clone() else {
            return self.abort("no proposal to patch with".to_string());
        };
        let patch = proposal.patch;

        if let Err(e) = patch.check_disjoint() {
            return self.fail_patch(patch, e);
        }
        let risk = classify(&patch, &self.request.constraints, self.config.module_system);

        // Inversion is computed before apply commits; a patch that
        // cannot be rolled back is never applied.
        let rollback = match RollbackPlan::compute(&patch, &self.tree) {
            Ok(plan) => plan,
            Err(e) => return self.fail_patch(patch, e),
        };

        match patch.apply(&self.tree) {
            Err(e) => {
                self.push_record(patch, risk, Vec::new(), IterationOutcome::Failed);
                self.abort(e.to_string())
            }
            Ok(next) => {
                let touched = patch.touched_paths();
                if let Err(e) = next.sync(&self.root, &touched) {
                    // Disk may be half-written; restore before surfacing.
                    let _ = rollback.execute(&self.root);
                    return Err(e);
                }
                self.pending_risk = Some(risk);
                self.rollback = Some(rollback);
                self.patched = Some(next);
                self.applied = true;
                self.phase = Phase::Validating;
                Ok(())
            }
        }
    }

    fn fail_patch(&mut self, patch: PatchSet, error: EngineError) -> Result<()> {
        let risk = classify(&patch, &self.request.constraints, self.config.module_system);
        self.push_record(patch, risk, Vec::new(), IterationOutcome::Failed);
        self.abort(error.to_string())
    }

    fn step_validating(&mut self) {
        let results = run_plan(&self.plan, &self.root);
        self.pending_results = Some(results);
        self.phase = Phase::Critiquing;
    }

    fn step_critiquing(&mut self) -> Result<()> {
        let results = self.pending_results.take().unwrap_or_default();
        let mut patch = self
            .proposal
            .as_ref()
            .map(|p| p.patch.clone())
            .unwrap_or_default();
        let mut risk = self.pending_risk.take().unwrap_or_else(|| {
            classify(&patch, &self.request.constraints, self.config.module_system)
        });

        let failures = results.iter().any(|r| r.failed());
        if !failures {
            // A formatter or test fixture may have rewritten files; fold
            // that drift into the patch so the accepted diff matches the
            // tree that validated.
            self.fold_tool_drift(&mut patch, &mut risk)?;

            let proposal = self.proposal.clone().unwrap_or(PatchProposal {
                plan: String::new(),
                patch: patch.clone(),
                tests: None,
            });
            let critique = self.planner.critique(&proposal, &results)?;
            if critique.approved {
                self.push_record(patch, risk, results, IterationOutcome::Passed);
                self.accepted = Some(self.history.len() - 1);
                if let Some(patched) = self.patched.take() {
                    self.tree = patched;
                }
                self.phase = Phase::Finalized;
                info!("request finalized");
                return Ok(());
            }
            warn!(notes = ?critique.notes, "self-critique rejected a green patch");
            self.critique_notes = critique.notes;
        }

        self.push_record(patch, risk, results, IterationOutcome::Failed);
        let attempts = self.completed_attempts();
        if attempts < self.config.max_iterations {
            self.phase = Phase::Iterating;
        } else {
            self.revert()?;
            self.phase = Phase::Aborted {
                reason: EngineError::IterationBudgetExhausted { attempts }.to_string(),
            };
        }
        Ok(())
    }

    /// Replace the patch entries for any path a validation command
    /// rewrote, so the accepted patch reproduces the validated tree.
    fn fold_tool_drift(
        &mut self,
        patch: &mut PatchSet,
        risk: &mut RiskAssessment,
    ) -> Result<()> {
        let Some(patched) = &self.patched else {
            return Ok(());
        };
        let disk = WorkingTree::load(&self.root)?;
        let drifted = patched.diff_paths(&disk);
        if drifted.is_empty() {
            return Ok(());
        }
        info!(paths = drifted.len(), "folding tool-driven changes into the patch");

        for path in &drifted {
            match disk.get(path) {
                Some(content) => {
                    if patch.created.contains_key(path) {
                        patch.created.insert(path.clone(), content.to_string());
                    } else if let Some(pos) =
                        patch.diffs.iter().position(|d| &d.path == path)
                    {
                        let pristine = self.tree.get(path).unwrap_or("");
                        patch.diffs[pos] =
                            FileDiff::replacing(path.clone(), pristine, content);
                    } else if let Some(pristine) = self.tree.get(path) {
                        patch
                            .diffs
                            .push(FileDiff::replacing(path.clone(), pristine, content));
                    } else {
                        patch.created.insert(path.clone(), content.to_string());
                    }
                }
                None => {
                    if patch.created.remove(path).is_none() {
                        patch.diffs.retain(|d| &d.path != path);
                        if self.tree.contains(path) && !patch.deleted.contains(path) {
                            patch.deleted.push(path.clone());
                        }
                    }
                }
            }
        }

        *risk = classify(patch, &self.request.constraints, self.config.module_system);
        self.rollback = Some(RollbackPlan::compute(patch, &self.tree)?);
        self.patched = Some(disk);
        if let Some(proposal) = self.proposal.as_mut() {
            proposal.patch = patch.clone();
        }
        Ok(())
    }

    fn completed_attempts(&self) -> usize {
        self.history
            .iter()
            .filter(|r| {
                matches!(
                    r.outcome,
                    IterationOutcome::Passed | IterationOutcome::Failed
                )
            })
            .count()
    }

    fn push_record(
        &mut self,
        patch: PatchSet,
        risk: RiskAssessment,
        results: Vec<ValidationResult>,
        outcome: IterationOutcome,
    ) {
        self.history.push(IterationRecord {
            seq: self.history.len() + 1,
            patch,
            risk,
            results,
            outcome,
            recorded_at: Utc::now(),
        });
    }

    fn revert(&mut self) -> Result<()> {
        if self.applied {
            if let Some(rollback) = &self.rollback {
                rollback.execute(&self.root)?;
            }
            self.applied = false;
            self.reverted = true;
            self.rollback = None;
            self.patched = None;
        }
        Ok(())
    }

    fn abort(&mut self, reason: String) -> Result<()> {
        self.revert()?;
        warn!(%reason, "request aborted");
        self.phase = Phase::Aborted { reason };
        Ok(())
    }

    /// Render the engine's current state as a protocol reply. Total:
    /// every state, including suspension and abort, maps to a valid
    /// nine-section reply.
    pub fn reply(&self) -> Reply {
        let record = self
            .accepted
            .and_then(|i| self.history.get(i))
            .or_else(|| self.history.last());

        let (diffs, new_files, deleted_files) = record
            .map(|r| patch_sections(&r.patch))
            .unwrap_or((None, None, None));

        let commands = if self.plan.commands.is_empty() {
            None
        } else {
            Some(
                self.plan
                    .commands
                    .iter()
                    .map(|c| c.command.clone())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        };

        let tests = record
            .map(|r| {
                r.results
                    .iter()
                    .filter(|x| x.category == CheckCategory::Test)
                    .map(|x| {
                        format!(
                            "{}: {} ({:.1}s)",
                            x.command,
                            x.status.as_str(),
                            x.duration.as_secs_f64()
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|t| !t.is_empty())
            .or_else(|| self.proposal.as_ref().and_then(|p| p.tests.clone()));

        let mut notes = Vec::new();
        for r in &self.history {
            let summary = if r.results.is_empty() {
                r.outcome.as_str().to_string()
            } else {
                format!(
                    "{} ({})",
                    r.outcome.as_str(),
                    r.results
                        .iter()
                        .map(|x| format!("{}: {}", x.command, x.status.as_str()))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            notes.push(format!("iteration {}: {}", r.seq, summary));
            for result in r.results.iter().filter(|x| x.failed()) {
                let output = crate::validate::truncate_output(&result.output, 200);
                if !output.is_empty() {
                    notes.push(format!("  {}: {}", result.command, output.replace('\n', " | ")));
                }
            }
        }
        if let Some(critique) = &self.critique_notes {
            notes.push(format!("critique: {}", critique));
        }
        match &self.phase {
            Phase::Aborted { reason } => {
                notes.push(format!("aborted: {}", reason));
                if self.reverted {
                    notes.push("working tree restored to pre-request state".to_string());
                } else {
                    notes.push("no changes were applied".to_string());
                }
            }
            Phase::BlockedOnClarification { question } => {
                notes.push(format!("awaiting clarification: {}", question));
            }
            Phase::Finalized => {
                notes.push(format!(
                    "completed after {} attempt(s)",
                    self.completed_attempts()
                ));
            }
            _ => {}
        }

        let rollback = match &self.phase {
            Phase::Finalized => self
                .rollback
                .as_ref()
                .map(|plan| plan.instructions().join("\n")),
            _ => None,
        };

        Reply {
            plan: self.proposal.as_ref().map(|p| p.plan.clone()),
            risks: record.map(|r| r.risk.render()),
            diffs,
            new_files,
            deleted_files,
            commands,
            tests,
            notes: if notes.is_empty() {
                None
            } else {
                Some(notes.join("\n"))
            },
            rollback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::parse_unified;
    use crate::planner::Critique;
    use crate::request::Constraints;
    use crate::validate::ValidationCommand;
    use std::collections::VecDeque;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct ScriptedPlanner {
        proposals: VecDeque<PatchProposal>,
        calls: usize,
        approve: bool,
    }

    impl ScriptedPlanner {
        fn new(proposals: Vec<PatchProposal>) -> Self {
            Self {
                proposals: proposals.into(),
                calls: 0,
                approve: true,
            }
        }
    }

    impl Planner for ScriptedPlanner {
        fn propose(
            &mut self,
            _request: &RefactorRequest,
            _tree: &WorkingTree,
            _clarifications: &[(String, String)],
            _failure: Option<&IterationRecord>,
        ) -> Result<PatchProposal> {
            self.calls += 1;
            self.proposals
                .pop_front()
                .ok_or_else(|| EngineError::PlannerFailed("script exhausted".to_string()))
        }

        fn critique(
            &mut self,
            _proposal: &PatchProposal,
            _results: &[ValidationResult],
        ) -> Result<Critique> {
            Ok(Critique {
                approved: self.approve,
                notes: if self.approve {
                    None
                } else {
                    Some("hidden behavior change".to_string())
                },
            })
        }
    }

    fn constraints() -> Constraints {
        Constraints {
            no_new_dependencies: true,
            behavior_preserving: true,
            allow_breaking: false,
        }
    }

    fn repo_with_file() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.ts"), "let a = 1;\n").unwrap();
        dir
    }

    fn bump_proposal() -> PatchProposal {
        PatchProposal {
            plan: "1. bump the literal".to_string(),
            patch: PatchSet {
                diffs: parse_unified(
                    "--- src/a.ts\n+++ src/a.ts\n@@ -1,1 +1,1 @@\n-let a = 1;\n+let a = 2;\n",
                )
                .unwrap(),
                ..Default::default()
            },
            tests: None,
        }
    }

    fn config_with(commands: Vec<ValidationCommand>, max_iterations: usize) -> EngineConfig {
        EngineConfig {
            validation: commands,
            max_iterations,
            ..Default::default()
        }
    }

    fn request(goal: &str, scope: Vec<&str>) -> RefactorRequest {
        RefactorRequest::new(
            goal.to_string(),
            scope.into_iter().map(|s| s.to_string()).collect(),
            constraints(),
        )
    }

    #[test]
    fn test_full_pass_flow_finalizes() {
        let dir = repo_with_file();
        let config = config_with(
            vec![ValidationCommand::new("true", CheckCategory::Test)],
            3,
        );
        let mut engine = Engine::new(
            dir.path().to_path_buf(),
            request("bump the literal in a.ts", vec!["src/a.ts"]),
            config,
            ScriptedPlanner::new(vec![bump_proposal()]),
        )
        .unwrap();

        assert_eq!(engine.run().unwrap(), &Phase::Finalized);
        assert_eq!(
            fs::read_to_string(dir.path().join("src/a.ts")).unwrap(),
            "let a = 2;\n"
        );
        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.history()[0].outcome, IterationOutcome::Passed);

        let reply = engine.reply();
        assert!(reply.plan.is_some());
        assert!(reply.diffs.is_some());
        assert!(reply.rollback.unwrap().contains("revert src/a.ts"));
    }

    #[test]
    fn test_validation_failure_aborts_and_reverts() {
        // typecheck passes, tests fail, budget of one: the engine must
        // abort and the tree must come back untouched.
        let dir = repo_with_file();
        let config = config_with(
            vec![
                ValidationCommand::new("true", CheckCategory::Typecheck),
                ValidationCommand::new("false", CheckCategory::Test),
            ],
            1,
        );
        let mut engine = Engine::new(
            dir.path().to_path_buf(),
            request("bump the literal in a.ts", vec!["src/a.ts"]),
            config,
            ScriptedPlanner::new(vec![bump_proposal()]),
        )
        .unwrap();

        let phase = engine.run().unwrap().clone();
        assert!(matches!(phase, Phase::Aborted { .. }));
        assert_eq!(
            fs::read_to_string(dir.path().join("src/a.ts")).unwrap(),
            "let a = 1;\n"
        );
        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.history()[0].outcome, IterationOutcome::Failed);
        assert!(engine.history()[0].results[1].failed());

        let reply = engine.reply();
        assert!(reply.rollback.is_none());
        let notes = reply.notes.unwrap();
        assert!(notes.contains("iteration budget exhausted"));
        assert!(notes.contains("restored to pre-request state"));
    }

    #[test]
    fn test_iteration_bound_limits_planning() {
        let dir = repo_with_file();
        let config = config_with(
            vec![ValidationCommand::new("false", CheckCategory::Test)],
            2,
        );
        let mut engine = Engine::new(
            dir.path().to_path_buf(),
            request("bump the literal in a.ts", vec!["src/a.ts"]),
            config,
            ScriptedPlanner::new(vec![bump_proposal(), bump_proposal(), bump_proposal()]),
        )
        .unwrap();

        let phase = engine.run().unwrap().clone();
        assert!(matches!(phase, Phase::Aborted { .. }));
        // budget of two: the planner was consulted exactly twice
        assert_eq!(engine.planner().calls, 2);
        assert_eq!(engine.history().len(), 2);
        // every attempt keeps its own validation results
        assert_eq!(engine.history()[0].results.len(), 1);
        assert_eq!(engine.history()[1].results.len(), 1);
    }

    #[test]
    fn test_ambiguous_scope_blocks_then_answer_unblocks() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/parser.ts"), "let p = 1;\n").unwrap();
        fs::write(dir.path().join("src/printer.ts"), "let q = 1;\n").unwrap();

        let proposal = PatchProposal {
            plan: "1. bump parser".to_string(),
            patch: PatchSet {
                diffs: parse_unified(
                    "--- src/parser.ts\n+++ src/parser.ts\n@@ -1,1 +1,1 @@\n-let p = 1;\n+let p = 2;\n",
                )
                .unwrap(),
                ..Default::default()
            },
            tests: None,
        };
        let config = config_with(
            vec![ValidationCommand::new("true", CheckCategory::Test)],
            3,
        );
        let mut engine = Engine::new(
            dir.path().to_path_buf(),
            request("tighten error handling", vec!["src/*.ts"]),
            config,
            ScriptedPlanner::new(vec![proposal]),
        )
        .unwrap();

        let phase = engine.run().unwrap().clone();
        let Phase::BlockedOnClarification { question } = phase else {
            panic!("expected suspension, got {:?}", phase);
        };
        assert!(question.contains("src/parser.ts"));
        assert!(question.contains("src/printer.ts"));
        // no planning happened while blocked
        assert_eq!(engine.planner().calls, 0);

        engine.answer("ANSWER: target src/parser.ts").unwrap();
        assert_eq!(engine.run().unwrap(), &Phase::Finalized);
        assert_eq!(
            fs::read_to_string(dir.path().join("src/parser.ts")).unwrap(),
            "let p = 2;\n"
        );
    }

    #[test]
    fn test_answer_without_slot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/parser.ts"), "let p = 1;\n").unwrap();
        fs::write(dir.path().join("src/printer.ts"), "let q = 1;\n").unwrap();

        let mut engine = Engine::new(
            dir.path().to_path_buf(),
            request("tighten error handling", vec!["src/*.ts"]),
            config_with(vec![], 3),
            ScriptedPlanner::new(vec![]),
        )
        .unwrap();
        engine.run().unwrap();
        assert!(matches!(
            engine.answer("the parser one").unwrap_err(),
            EngineError::MalformedAnswer { .. }
        ));
        // still suspended
        assert!(matches!(
            engine.phase(),
            Phase::BlockedOnClarification { .. }
        ));
    }

    #[test]
    fn test_hunk_conflict_aborts_without_mutation() {
        let dir = repo_with_file();
        let stale = PatchProposal {
            plan: "1. edit a line that is not there".to_string(),
            patch: PatchSet {
                diffs: parse_unified(
                    "--- src/a.ts\n+++ src/a.ts\n@@ -1,1 +1,1 @@\n-let a = 99;\n+let a = 2;\n",
                )
                .unwrap(),
                ..Default::default()
            },
            tests: None,
        };
        let mut engine = Engine::new(
            dir.path().to_path_buf(),
            request("bump the literal in a.ts", vec!["src/a.ts"]),
            config_with(vec![], 3),
            ScriptedPlanner::new(vec![stale]),
        )
        .unwrap();

        let phase = engine.run().unwrap().clone();
        let Phase::Aborted { reason } = phase else {
            panic!("expected abort, got {:?}", phase);
        };
        assert!(reason.contains("hunk conflict"));
        assert_eq!(
            fs::read_to_string(dir.path().join("src/a.ts")).unwrap(),
            "let a = 1;\n"
        );
        let notes = engine.reply().notes.unwrap();
        assert!(notes.contains("no changes were applied"));
    }

    #[test]
    fn test_critique_rejection_consumes_budget() {
        let dir = repo_with_file();
        let config = config_with(
            vec![ValidationCommand::new("true", CheckCategory::Test)],
            1,
        );
        let mut planner = ScriptedPlanner::new(vec![bump_proposal()]);
        planner.approve = false;
        let mut engine = Engine::new(
            dir.path().to_path_buf(),
            request("bump the literal in a.ts", vec!["src/a.ts"]),
            config,
            planner,
        )
        .unwrap();

        let phase = engine.run().unwrap().clone();
        assert!(matches!(phase, Phase::Aborted { .. }));
        assert_eq!(
            fs::read_to_string(dir.path().join("src/a.ts")).unwrap(),
            "let a = 1;\n"
        );
        assert!(engine.reply().notes.unwrap().contains("hidden behavior change"));
    }

    #[test]
    fn test_formatter_drift_folds_into_patch() {
        let dir = repo_with_file();
        let config = config_with(
            vec![
                ValidationCommand::new("true", CheckCategory::Test),
                ValidationCommand::new(
                    "printf '// formatted\\n' >> src/a.ts",
                    CheckCategory::Format,
                ),
            ],
            3,
        );
        let mut engine = Engine::new(
            dir.path().to_path_buf(),
            request("bump the literal in a.ts", vec!["src/a.ts"]),
            config,
            ScriptedPlanner::new(vec![bump_proposal()]),
        )
        .unwrap();

        assert_eq!(engine.run().unwrap(), &Phase::Finalized);
        let on_disk = fs::read_to_string(dir.path().join("src/a.ts")).unwrap();
        assert!(on_disk.contains("// formatted"));

        // The accepted patch reproduces the validated tree from the
        // pre-request snapshot.
        let record = &engine.history()[0];
        let mut pristine = WorkingTree::empty();
        pristine.insert(PathBuf::from("src/a.ts"), "let a = 1;\n".to_string());
        let replayed = record.patch.apply(&pristine).unwrap();
        assert_eq!(replayed.get(Path::new("src/a.ts")), Some(on_disk.as_str()));

        assert!(engine.reply().diffs.unwrap().contains("// formatted"));
    }

    #[test]
    fn test_cancel_from_blocked_aborts() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/parser.ts"), "let p = 1;\n").unwrap();
        fs::write(dir.path().join("src/printer.ts"), "let q = 1;\n").unwrap();

        let mut engine = Engine::new(
            dir.path().to_path_buf(),
            request("tighten error handling", vec!["src/*.ts"]),
            config_with(vec![], 3),
            ScriptedPlanner::new(vec![]),
        )
        .unwrap();
        engine.run().unwrap();
        engine.cancel().unwrap();
        assert!(matches!(engine.phase(), Phase::Aborted { .. }));
    }
}
