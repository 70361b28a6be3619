use anyhow::{bail, Context, Result};
use clap::Parser;
use reforge::config::EngineConfig;
use reforge::phase::{Engine, Phase};
use reforge::planner::CommandPlanner;
use reforge::request::{Constraints, RefactorRequest};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "reforge",
    about = "Turn a refactor request into a validated, reversible patch set",
    version
)]
struct Args {
    /// Path to the repository (defaults to current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// JSON request file with goal, scope, and constraint overrides
    #[arg(short, long)]
    request: Option<PathBuf>,

    /// Free-text goal (alternative to --request)
    #[arg(short, long)]
    goal: Option<String>,

    /// Scope glob, repeatable (with --goal)
    #[arg(long)]
    scope: Vec<String>,

    /// Planner command override (defaults to reforge.toml)
    #[arg(long)]
    planner: Option<String>,

    /// Iteration budget override
    #[arg(long)]
    max_iterations: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let root = args.path.canonicalize().context("resolving repo path")?;

    let mut config = EngineConfig::load(&root).context("loading reforge.toml")?;
    if let Some(max) = args.max_iterations {
        config.max_iterations = max;
    }
    if let Some(planner) = args.planner {
        config.planner_command = Some(planner);
    }

    let defaults = Constraints::from_config(&config);
    let request = match (&args.request, &args.goal) {
        (Some(path), _) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            RefactorRequest::from_json(&raw, &defaults)?
        }
        (None, Some(goal)) => {
            RefactorRequest::new(goal.clone(), args.scope.clone(), defaults)
        }
        (None, None) => bail!("either --request or --goal is required"),
    };

    let Some(planner_command) = config.planner_command.clone() else {
        bail!("no planner command configured; set planner_command in reforge.toml or pass --planner");
    };
    let planner = CommandPlanner::new(
        planner_command,
        root.clone(),
        Duration::from_secs(config.planner_timeout_secs),
    );

    let mut engine = Engine::new(root, request, config, planner)?;
    loop {
        let phase = engine.run()?.clone();
        match phase {
            Phase::BlockedOnClarification { question } => {
                eprintln!("clarification needed: {}", question);
                eprint!("answer (empty line cancels): ");
                io::stderr().flush().ok();
                let mut line = String::new();
                io::stdin().lock().read_line(&mut line)?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    engine.cancel()?;
                } else {
                    engine.answer(&format!("ANSWER: {}", trimmed))?;
                }
            }
            Phase::Finalized => {
                print!("{}", engine.reply().render());
                return Ok(());
            }
            Phase::Aborted { reason } => {
                print!("{}", engine.reply().render());
                eprintln!("aborted: {}", reason);
                std::process::exit(2);
            }
            other => bail!("engine suspended in unexpected phase {}", other.name()),
        }
    }
}
