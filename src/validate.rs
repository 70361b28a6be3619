//! Validation runner
//!
//! Executes the external check commands for a patch attempt: type
//! checker, linter, test runner, formatter. Commands run in declared
//! order and all of them run even after a failure, so the caller sees
//! the complete health picture; a command flagged `fatal` short-circuits
//! the rest, which are reported as skipped. Every command is
//! time-bounded.

use crate::config::EngineConfig;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckCategory {
    Typecheck,
    Lint,
    Test,
    Format,
}

impl CheckCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckCategory::Typecheck => "typecheck",
            CheckCategory::Lint => "lint",
            CheckCategory::Test => "test",
            CheckCategory::Format => "format",
        }
    }
}

/// One shell-invocable validation command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCommand {
    pub command: String,
    pub category: CheckCategory,
    /// Skip the remaining commands when this one fails
    #[serde(default)]
    pub fatal: bool,
    /// Expected exit code; anything else is a failure
    #[serde(default)]
    pub expected_exit: i32,
}

impl ValidationCommand {
    pub fn new(command: impl Into<String>, category: CheckCategory) -> Self {
        Self {
            command: command.into(),
            category,
            fatal: false,
            expected_exit: 0,
        }
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

/// The ordered checks for one iteration, with its time bounds
#[derive(Debug, Clone)]
pub struct ValidationPlan {
    pub commands: Vec<ValidationCommand>,
    pub command_timeout: Duration,
    pub plan_timeout: Duration,
}

impl ValidationPlan {
    /// Build the plan from explicit config commands, or detect one from
    /// the project type when none are configured.
    pub fn assemble(config: &EngineConfig, root: &Path) -> Self {
        let commands = if config.validation.is_empty() {
            detect_commands(root)
        } else {
            config.validation.clone()
        };
        Self {
            commands,
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            plan_timeout: Duration::from_secs(config.plan_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Fail,
    Timeout,
    Skipped,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Fail => "fail",
            CheckStatus::Timeout => "timeout",
            CheckStatus::Skipped => "skipped",
        }
    }
}

/// Outcome of one validation command. Owned by the iteration that ran
/// it; the next iteration produces a fresh set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub command: String,
    pub category: CheckCategory,
    pub status: CheckStatus,
    /// Combined stdout/stderr (truncated)
    pub output: String,
    pub duration: Duration,
}

impl ValidationResult {
    /// A timeout is a failure; skipped commands are not counted against
    /// the attempt (whatever forced the skip already is).
    pub fn failed(&self) -> bool {
        matches!(self.status, CheckStatus::Fail | CheckStatus::Timeout)
    }

    fn skipped(command: &ValidationCommand, reason: &str) -> Self {
        Self {
            command: command.command.clone(),
            category: command.category,
            status: CheckStatus::Skipped,
            output: reason.to_string(),
            duration: Duration::ZERO,
        }
    }
}

/// Run every command in the plan, in order.
pub fn run_plan(plan: &ValidationPlan, root: &Path) -> Vec<ValidationResult> {
    let deadline = Instant::now() + plan.plan_timeout;
    let mut results = Vec::with_capacity(plan.commands.len());
    let mut skip_reason: Option<String> = None;

    for command in &plan.commands {
        if let Some(reason) = &skip_reason {
            results.push(ValidationResult::skipped(command, reason));
            continue;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            results.push(ValidationResult::skipped(
                command,
                "overall validation deadline exceeded",
            ));
            continue;
        }

        let timeout = plan.command_timeout.min(remaining);
        let result = run_command(command, root, timeout);
        info!(
            command = %result.command,
            status = result.status.as_str(),
            ms = result.duration.as_millis() as u64,
            "validation command finished"
        );
        if result.failed() && command.fatal {
            skip_reason = Some(format!("skipped after fatal failure of `{}`", command.command));
        }
        results.push(result);
    }

    results
}

fn run_command(command: &ValidationCommand, root: &Path, timeout: Duration) -> ValidationResult {
    let start = Instant::now();
    let run = run_shell(&command.command, root, None, timeout);
    let duration = start.elapsed();

    match run {
        Ok(output) => {
            let status = if output.timed_out {
                CheckStatus::Timeout
            } else if output.status.and_then(|s| s.code()) == Some(command.expected_exit) {
                CheckStatus::Pass
            } else {
                CheckStatus::Fail
            };
            ValidationResult {
                command: command.command.clone(),
                category: command.category,
                status,
                output: truncate_output(&output.combined(), 1800),
                duration,
            }
        }
        Err(message) => {
            warn!(command = %command.command, error = %message, "validation command could not run");
            ValidationResult {
                command: command.command.clone(),
                category: command.category,
                status: CheckStatus::Fail,
                output: format!("failed to run: {}", message),
                duration,
            }
        }
    }
}

#[derive(Debug)]
pub struct ShellOutput {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ShellOutput {
    pub fn combined(&self) -> String {
        let mut combined = String::new();
        if !self.stdout.is_empty() {
            combined.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&self.stderr);
        }
        combined
    }
}

/// Run a shell command with a hard time bound, optionally feeding it
/// stdin, capturing both output streams. On timeout the child is killed.
pub fn run_shell(
    command: &str,
    root: &Path,
    input: Option<&str>,
    timeout: Duration,
) -> Result<ShellOutput, String> {
    let mut builder = Command::new("sh");
    builder
        .arg("-c")
        .arg(command)
        .current_dir(root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if input.is_some() {
        builder.stdin(Stdio::piped());
    } else {
        builder.stdin(Stdio::null());
    }

    let mut child = builder
        .spawn()
        .map_err(|e| format!("failed to start command: {}", e))?;

    if let Some(text) = input {
        if let Some(mut stdin) = child.stdin.take() {
            let owned = text.to_string();
            thread::spawn(move || {
                let _ = stdin.write_all(owned.as_bytes());
            });
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "failed to capture stderr".to_string())?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stdout);
        let _ = reader.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stderr);
        let _ = reader.read_to_end(&mut buf);
        buf
    });

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    let _ = child.kill();
                    match child.wait() {
                        Ok(status) => break Some(status),
                        Err(_) => break None,
                    }
                }
                thread::sleep(Duration::from_millis(25));
            }
            Err(e) => return Err(format!("failed to wait for command: {}", e)),
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(ShellOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
    })
}

pub fn truncate_output(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    let char_count = trimmed.chars().count();
    if char_count <= max {
        trimmed.to_string()
    } else {
        let snippet: String = trimmed.chars().take(max).collect();
        format!("{}\n… (truncated)", snippet)
    }
}

/// Detected project type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectType {
    Node,
    Rust,
    Python,
    Go,
    Unknown,
}

pub fn detect_project_type(root: &Path) -> ProjectType {
    if root.join("package.json").exists() {
        ProjectType::Node
    } else if root.join("Cargo.toml").exists() {
        ProjectType::Rust
    } else if root.join("pyproject.toml").exists()
        || root.join("setup.py").exists()
        || root.join("requirements.txt").exists()
    {
        ProjectType::Python
    } else if root.join("go.mod").exists() {
        ProjectType::Go
    } else {
        ProjectType::Unknown
    }
}

/// Conventional validation plan per project type. The type checker is
/// fatal: with broken types the remaining signals are noise.
fn detect_commands(root: &Path) -> Vec<ValidationCommand> {
    use CheckCategory::*;
    let commands = match detect_project_type(root) {
        ProjectType::Node => vec![
            ValidationCommand::new("npx tsc --noEmit", Typecheck).fatal(),
            ValidationCommand::new("npx eslint .", Lint),
            ValidationCommand::new("npm test --silent", Test),
            ValidationCommand::new("npx prettier --check .", Format),
        ],
        ProjectType::Rust => vec![
            ValidationCommand::new("cargo check -q", Typecheck).fatal(),
            ValidationCommand::new("cargo clippy -q --no-deps", Lint),
            ValidationCommand::new("cargo test -q", Test),
            ValidationCommand::new("cargo fmt -- --check", Format),
        ],
        ProjectType::Python => vec![
            ValidationCommand::new("python -m compileall -q .", Typecheck).fatal(),
            ValidationCommand::new("pytest -q", Test),
        ],
        ProjectType::Go => vec![
            ValidationCommand::new("go vet ./...", Lint).fatal(),
            ValidationCommand::new("go test ./...", Test),
        ],
        ProjectType::Unknown => Vec::new(),
    };
    debug!(count = commands.len(), "validation commands detected");
    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn plan(commands: Vec<ValidationCommand>) -> ValidationPlan {
        ValidationPlan {
            commands,
            command_timeout: Duration::from_secs(5),
            plan_timeout: Duration::from_secs(10),
        }
    }

    fn cwd() -> PathBuf {
        std::env::current_dir().unwrap()
    }

    #[test]
    fn test_pass_and_fail_capture() {
        let results = run_plan(
            &plan(vec![
                ValidationCommand::new("echo checked", CheckCategory::Typecheck),
                ValidationCommand::new("exit 3", CheckCategory::Test),
            ]),
            &cwd(),
        );
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, CheckStatus::Pass);
        assert!(results[0].output.contains("checked"));
        assert_eq!(results[1].status, CheckStatus::Fail);
        assert!(results[1].failed());
    }

    #[test]
    fn test_no_short_circuit_without_fatal() {
        let results = run_plan(
            &plan(vec![
                ValidationCommand::new("false", CheckCategory::Lint),
                ValidationCommand::new("echo still-ran", CheckCategory::Test),
            ]),
            &cwd(),
        );
        assert_eq!(results[1].status, CheckStatus::Pass);
        assert!(results[1].output.contains("still-ran"));
    }

    #[test]
    fn test_fatal_skips_remaining() {
        let results = run_plan(
            &plan(vec![
                ValidationCommand::new("false", CheckCategory::Typecheck).fatal(),
                ValidationCommand::new("echo never", CheckCategory::Test),
            ]),
            &cwd(),
        );
        assert_eq!(results[0].status, CheckStatus::Fail);
        assert_eq!(results[1].status, CheckStatus::Skipped);
        assert!(!results[1].failed());
    }

    #[test]
    fn test_timeout_is_failure() {
        let mut p = plan(vec![ValidationCommand::new("sleep 5", CheckCategory::Test)]);
        p.command_timeout = Duration::from_millis(200);
        let results = run_plan(&p, &cwd());
        assert_eq!(results[0].status, CheckStatus::Timeout);
        assert!(results[0].failed());
    }

    #[test]
    fn test_expected_exit_override() {
        let mut command = ValidationCommand::new("exit 1", CheckCategory::Lint);
        command.expected_exit = 1;
        let results = run_plan(&plan(vec![command]), &cwd());
        assert_eq!(results[0].status, CheckStatus::Pass);
    }

    #[test]
    fn test_run_shell_feeds_stdin() {
        let output = run_shell("cat", &cwd(), Some("ping"), Duration::from_secs(5)).unwrap();
        assert_eq!(output.stdout, "ping");
        assert!(!output.timed_out);
    }

    #[test]
    fn test_truncate_output_unicode_safe() {
        let input = "错误: 失败 😊";
        let out = truncate_output(input, 5);
        assert_eq!(out, "错误: 失\n… (truncated)");
    }

    #[test]
    fn test_detect_rust_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        assert_eq!(detect_project_type(dir.path()), ProjectType::Rust);
    }
}
