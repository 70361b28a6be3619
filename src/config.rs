//! Engine configuration
//!
//! Read once at intake from `reforge.toml` in the repository root and
//! threaded through every phase call. Nothing here mutates after load.

use crate::validate::ValidationCommand;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Module system of the target project; drives public-export detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleSystem {
    #[default]
    Esm,
    Cjs,
}

impl ModuleSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleSystem::Esm => "esm",
            ModuleSystem::Cjs => "cjs",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Refuse plans that add dependencies
    #[serde(default = "default_true")]
    pub no_new_dependencies: bool,
    /// Default constraint: refactors must not change observable behavior
    #[serde(default = "default_true")]
    pub behavior_preserving: bool,
    /// Default constraint: breaking public-API changes allowed
    #[serde(default)]
    pub allow_breaking: bool,
    /// Maximum plan->patch->validate attempts before aborting
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub module_system: ModuleSystem,
    /// Per-command validation timeout in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Overall validation-plan timeout in seconds
    #[serde(default = "default_plan_timeout")]
    pub plan_timeout_secs: u64,
    /// Time bound for one external planner invocation, in seconds
    #[serde(default = "default_planner_timeout")]
    pub planner_timeout_secs: u64,
    /// External command that produces patch proposals (protocol on stdio)
    #[serde(default)]
    pub planner_command: Option<String>,
    /// Explicit validation commands; when empty the plan is detected
    /// from the project type
    #[serde(default)]
    pub validation: Vec<ValidationCommand>,
}

fn default_true() -> bool {
    true
}

fn default_max_iterations() -> usize {
    3
}

fn default_command_timeout() -> u64 {
    120
}

fn default_plan_timeout() -> u64 {
    600
}

fn default_planner_timeout() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            no_new_dependencies: true,
            behavior_preserving: true,
            allow_breaking: false,
            max_iterations: default_max_iterations(),
            module_system: ModuleSystem::default(),
            command_timeout_secs: default_command_timeout(),
            plan_timeout_secs: default_plan_timeout(),
            planner_timeout_secs: default_planner_timeout(),
            planner_command: None,
            validation: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load `reforge.toml` from the repo root, falling back to defaults
    /// when the file does not exist.
    pub fn load(repo_root: &Path) -> anyhow::Result<Self> {
        let path = repo_root.join("reforge.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)?;
        let config: EngineConfig = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.no_new_dependencies);
        assert!(config.behavior_preserving);
        assert!(!config.allow_breaking);
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.module_system, ModuleSystem::Esm);
    }

    #[test]
    fn test_parse_partial_toml() {
        let raw = r#"
            allow_breaking = true
            max_iterations = 5
            module_system = "cjs"
        "#;
        let config: EngineConfig = toml::from_str(raw).unwrap();
        assert!(config.allow_breaking);
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.module_system, ModuleSystem::Cjs);
        // untouched fields keep their defaults
        assert!(config.behavior_preserving);
        assert_eq!(config.command_timeout_secs, 120);
    }

    #[test]
    fn test_validation_commands_from_toml() {
        let raw = r#"
            [[validation]]
            command = "npx tsc --noEmit"
            category = "typecheck"
            fatal = true

            [[validation]]
            command = "npm test"
            category = "test"
        "#;
        let config: EngineConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.validation.len(), 2);
        assert!(config.validation[0].fatal);
        assert!(!config.validation[1].fatal);
    }
}
