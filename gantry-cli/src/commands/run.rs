//! Run command handler
//!
//! Loads a pipeline file, checks its trigger, runs it in the workspace and
//! prints a summary. The exit code tells the caller how the run ended.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use gantry_core::domain::run::{RunContext, RunStatus};
use gantry_runner::notifier;
use gantry_runner::{
    InMemoryLogBuffer, LogBufferService, RunStore, RunnerConfig, ShellExecutor, StageRunner,
    load_pipeline,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

use super::parse_key_val;
use super::runs::print_run_details;

/// Exit code after an operator abort (128 + SIGINT)
const ABORT_EXIT_CODE: u8 = 130;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the pipeline file
    pub file: PathBuf,

    /// Branch the triggering push was made to
    #[arg(long, env = "BRANCH_NAME")]
    pub branch: Option<String>,

    /// Workspace directory (overrides $WORKSPACE)
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Job name (overrides $JOB_NAME, default: pipeline name)
    #[arg(long)]
    pub job_name: Option<String>,

    /// Build number (overrides $BUILD_NUMBER, default: next free number)
    #[arg(long)]
    pub build_number: Option<u64>,

    /// Base URL of this build on the CI server (overrides $BUILD_URL)
    #[arg(long)]
    pub build_url: Option<String>,

    /// Parameters as key=value pairs, visible to the pipeline as variables
    #[arg(short, long, value_parser = parse_key_val)]
    pub param: Vec<(String, String)>,

    /// Do not echo the console log while running
    #[arg(short, long)]
    pub quiet: bool,
}

/// Handle the run command
pub async fn handle_run_command(args: RunArgs) -> Result<ExitCode> {
    let config = load_config(&args)?;

    let store = RunStore::new(config.state_dir.clone());
    let build_number = match config.build_number {
        Some(n) => n,
        None => store.next_build_number()?,
    };

    let log_buffer = InMemoryLogBuffer::new().with_echo(!args.quiet);
    let log: Arc<dyn LogBufferService> = Arc::new(log_buffer);

    let params: BTreeMap<String, String> = args.param.iter().cloned().collect();
    let mut lua_vars = params.clone();
    lua_vars.insert(
        "WORKSPACE".to_string(),
        config.workspace.display().to_string(),
    );
    lua_vars.insert("BUILD_NUMBER".to_string(), build_number.to_string());
    if let Some(job) = &config.job_name {
        lua_vars.insert("JOB_NAME".to_string(), job.clone());
    }
    if let Some(url) = &config.build_url {
        lua_vars.insert("BUILD_URL".to_string(), url.clone());
    }
    if let Some(branch) = &args.branch {
        lua_vars.insert("BRANCH_NAME".to_string(), branch.clone());
    }

    let mut definition = load_pipeline(&args.file, lua_vars, log.clone())?;
    definition.environment.extend(params);

    let context = RunContext {
        job_name: config
            .job_name
            .clone()
            .unwrap_or_else(|| definition.name.clone()),
        build_number,
        build_url: config.build_url.clone(),
        workspace: config.workspace.clone(),
        branch: args.branch.clone(),
    };

    let runner = StageRunner::new(
        Arc::new(ShellExecutor::new(config.shell.clone())),
        notifier::from_config(&definition.notify, &config)?,
        log,
        store.clone(),
    )
    .with_default_timeout(config.stage_timeout);

    if !StageRunner::check_trigger(&definition, context.branch.as_deref()) {
        let record = runner.skip(&definition, &context)?;
        println!(
            "{}",
            format!(
                "Skipped {} #{}: branch '{}' does not trigger this pipeline",
                record.job_name,
                record.build_number,
                context.branch.as_deref().unwrap_or_default()
            )
            .yellow()
        );
        return Ok(ExitCode::SUCCESS);
    }

    info!(
        "Running {} as {} #{} in {}",
        args.file.display(),
        context.job_name,
        context.build_number,
        context.workspace.display()
    );

    let abort = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let record = runner.run_until(&definition, &context, abort).await?;

    println!();
    print_run_details(&record, &store);
    if record.status == RunStatus::Succeeded {
        println!();
        println!("{}", "Pipeline completed successfully".green().bold());
    }

    Ok(match record.status {
        RunStatus::Succeeded | RunStatus::Skipped => ExitCode::SUCCESS,
        RunStatus::Aborted => ExitCode::from(ABORT_EXIT_CODE),
        RunStatus::Failed | RunStatus::Running => ExitCode::FAILURE,
    })
}

/// Environment configuration with command-line overrides applied
fn load_config(args: &RunArgs) -> Result<RunnerConfig> {
    let mut config = RunnerConfig::from_env()?;

    if let Some(workspace) = &args.workspace {
        config = config.with_workspace(workspace.clone());
    }
    if args.job_name.is_some() {
        config.job_name = args.job_name.clone();
    }
    if args.build_number.is_some() {
        config.build_number = args.build_number;
    }
    if args.build_url.is_some() {
        config.build_url = args.build_url.clone();
    }

    std::fs::create_dir_all(&config.workspace).with_context(|| {
        format!(
            "Failed to create workspace {}",
            config.workspace.display()
        )
    })?;
    let workspace = config
        .workspace
        .canonicalize()
        .with_context(|| format!("Invalid workspace {}", config.workspace.display()))?;
    config = config.with_workspace(workspace);

    config.validate()?;
    Ok(config)
}
