pub mod analysis;
pub mod assertions;
pub mod config;
pub mod counterfactual;
pub mod errors;
pub mod instrument;
pub mod logging;
pub mod record;
pub mod recorder;
pub mod redact;
pub mod replay;
pub mod store;
pub mod types;

pub use errors::HindsightError;

use clap::{error::ErrorKind, Parser, Subcommand};
use config::{load_config, TraceConfig};
use std::path::{Path, PathBuf};
use store::LoadedRun;

#[derive(Debug, Parser)]
#[command(name = "hindsight")]
#[command(about = "Record, replay, and analyze autonomous agent runs")]
pub struct Cli {
    /// Optional TOML configuration overlay.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate a run directory and print a summary.
    Inspect { run_dir: PathBuf },
    /// Replay a run against its own recording and report divergences.
    Replay { run_dir: PathBuf },
    /// Run invariant checks, labels, and root-cause extraction.
    Analyze { run_dir: PathBuf },
    /// Evaluate built-in invariants plus an optional assertion file.
    Test {
        run_dir: PathBuf,
        assertion_file: Option<PathBuf>,
    },
}

/// Parse and dispatch one CLI invocation. Returns the subcommand's verdict
/// code; hard failures (unreadable artifacts, I/O) surface as errors.
pub fn run_with_args(args: &[std::ffi::OsString]) -> Result<i32, HindsightError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(HindsightError::Cli(error.to_string())),
        },
    };

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Inspect { run_dir } => inspect(&run_dir),
        Command::Replay { run_dir } => replay_cmd(&run_dir, &config),
        Command::Analyze { run_dir } => analyze_cmd(&run_dir),
        Command::Test {
            run_dir,
            assertion_file,
        } => test_cmd(&run_dir, assertion_file.as_deref()),
    }
}

fn inspect(run_dir: &Path) -> Result<i32, HindsightError> {
    let run = LoadedRun::load(run_dir)?;
    run.verify_contiguous()?;
    run.verify_snapshots()?;
    println!(
        "run {}: status={} steps={}{}{}",
        run.meta.run_id,
        run.meta.status.as_str(),
        run.steps.len(),
        if run.meta.truncated { " truncated" } else { "" },
        if run.partial { " partial" } else { "" },
    );
    Ok(0)
}

fn replay_cmd(run_dir: &Path, config: &TraceConfig) -> Result<i32, HindsightError> {
    // Replay traces land next to the source run.
    let mut config = config.clone();
    if let Some(parent) = run_dir.parent() {
        config.recorder.base_dir = parent.to_path_buf();
    }
    let _ = logging::init_diag_logger(config.recorder.base_dir.join(".hindsight/diag.jsonl"));
    let report = replay::replay_identity(run_dir, &config)?;
    println!(
        "replayed {} steps of {} into {}",
        report.replayed_steps,
        report.source_run_id,
        report.replay_run_dir.display()
    );
    for divergence in &report.divergences {
        println!(
            "  divergence {}: {}",
            divergence.kind.as_str(),
            divergence.detail
        );
    }
    if report.is_clean() {
        println!("no divergences");
        Ok(0)
    } else {
        println!("{} divergences", report.divergences.len());
        Ok(1)
    }
}

fn analyze_cmd(run_dir: &Path) -> Result<i32, HindsightError> {
    let run = LoadedRun::load(run_dir)?;
    let report = analysis::analyze_run(&run);
    print!("{}", report.render_text());
    Ok(0)
}

fn test_cmd(run_dir: &Path, assertion_file: Option<&Path>) -> Result<i32, HindsightError> {
    let run = LoadedRun::load(run_dir)?;
    let mut all_passed = true;

    for check in analysis::Analyzer::with_default_checks().run_checks(&run) {
        let verdict = if check.passed { "pass" } else { "fail" };
        println!("check {}: {verdict} ({})", check.name, check.detail);
        all_passed &= check.passed;
    }

    if let Some(path) = assertion_file {
        let assertions = assertions::load_assertions(path)?;
        for result in assertions::evaluate(&run, &assertions) {
            let verdict = if result.passed { "pass" } else { "fail" };
            println!("assert {}: {verdict} ({})", result.description, result.detail);
            all_passed &= result.passed;
        }
    }

    Ok(if all_passed { 0 } else { 1 })
}
