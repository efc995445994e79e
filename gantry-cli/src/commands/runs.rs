//! Runs command handlers
//!
//! Reads run records and console logs from the run store.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use gantry_core::domain::artifact::TestSummary;
use gantry_core::domain::run::{RunRecord, RunStatus, StageStatus};
use gantry_runner::{RunStore, RunnerConfig};
use std::path::PathBuf;

/// Runs subcommands
#[derive(Subcommand)]
pub enum RunsCommands {
    /// List recorded runs
    List,
    /// Show one run
    Show {
        /// Build number
        build: u64,

        /// Print the console log instead of the summary
        #[arg(long, conflicts_with = "json")]
        log: bool,

        /// Print the run record as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Handle runs commands
pub fn handle_runs_command(command: RunsCommands, workspace: Option<PathBuf>) -> Result<()> {
    let mut config = RunnerConfig::from_env()?;
    if let Some(workspace) = workspace {
        config = config.with_workspace(workspace);
    }
    let store = RunStore::new(config.state_dir);

    match command {
        RunsCommands::List => list_runs(&store),
        RunsCommands::Show { build, log, json } => show_run(&store, build, log, json),
    }
}

fn list_runs(store: &RunStore) -> Result<()> {
    let runs = store.list()?;

    if runs.is_empty() {
        println!("{}", "No runs found.".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} run(s):", runs.len()).bold());
    println!();
    for run in runs.iter().rev() {
        println!(
            "  {} #{} {} {}  {}{}",
            "▸".cyan(),
            run.build_number,
            run.job_name.bold(),
            colored_status(run.status),
            run.started_at
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
                .dimmed(),
            run.failure
                .as_ref()
                .map(|f| format!("  failed at '{}'", f.stage))
                .unwrap_or_default()
                .red()
        );
    }

    Ok(())
}

fn show_run(store: &RunStore, build: u64, log: bool, json: bool) -> Result<()> {
    if log {
        print!("{}", store.read_console_log(build)?);
        return Ok(());
    }

    let run = store.load(build)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run_details(&run, store);
    }
    Ok(())
}

/// Print the outcome of a run, stage by stage
pub fn print_run_details(run: &RunRecord, store: &RunStore) {
    let headline = format!("{} #{} ({})", run.job_name, run.build_number, run.pipeline);
    match run.status {
        RunStatus::Succeeded => println!("{} {}", "✓".green().bold(), headline.green().bold()),
        RunStatus::Running => println!("{} {}", "…".yellow(), headline.yellow()),
        RunStatus::Skipped => println!("{} {}", "-".yellow(), headline.yellow()),
        RunStatus::Failed | RunStatus::Aborted => {
            println!("{} {}", "✗".red().bold(), headline.red().bold())
        }
    }

    println!("  Status:   {}", colored_status(run.status));
    println!(
        "  Started:  {}",
        run.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(duration) = run.duration() {
        println!("  Duration: {}s", duration.num_seconds());
    }

    println!("  Stages:");
    for stage in &run.stages {
        let line = match stage.status {
            StageStatus::Succeeded => format!("    {} {}", "✓".green(), stage.name),
            StageStatus::Failed => format!(
                "    {} {}{}",
                "✗".red(),
                stage.name.red(),
                stage
                    .exit_code
                    .map(|c| format!(" (exit code {})", c))
                    .unwrap_or_default()
                    .red()
            ),
            StageStatus::Running => format!("    {} {}", "…".yellow(), stage.name),
            StageStatus::NotRun => format!("    {} {}", "-".dimmed(), stage.name.dimmed()),
        };
        println!("{}", line);
    }

    if !run.artifacts.is_empty() {
        println!("  Artifacts:");
        for artifact in &run.artifacts {
            println!(
                "    {} {}",
                artifact.path.cyan(),
                artifact
                    .fingerprint
                    .as_deref()
                    .map(|fp| format!("sha256:{}", fp))
                    .unwrap_or_default()
                    .dimmed()
            );
        }
    }

    if !run.reports.is_empty() {
        let total: TestSummary = run.reports.iter().map(|r| r.summary).sum();
        println!(
            "  Tests:    {} run, {} failed, {} errors, {} skipped",
            total.tests, total.failures, total.errors, total.skipped
        );
    }

    if let Some(failure) = &run.failure {
        println!("  Failure:  {}: {}", failure.stage.red(), failure.message);
        println!(
            "  Notified: {}",
            if run.notified { "yes".green() } else { "no".yellow() }
        );
    }

    println!(
        "  Log:      {}",
        store
            .console_log_path(run.build_number)
            .display()
            .to_string()
            .dimmed()
    );
}

fn colored_status(status: RunStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        RunStatus::Succeeded => label.green(),
        RunStatus::Failed | RunStatus::Aborted => label.red(),
        RunStatus::Running | RunStatus::Skipped => label.yellow(),
    }
}
