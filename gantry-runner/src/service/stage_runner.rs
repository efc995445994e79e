//! Stage runner service
//!
//! Runs a pipeline definition strictly in order:
//! - each stage's steps run one after another, stopping at the first failure
//! - `post.always` steps run after the stage body whatever its outcome
//! - the first failed stage ends the run, later stages are never started
//! - a failed run sends exactly one notification
//!
//! The run record and console log are persisted through the [`RunStore`]
//! after every stage, and the console log once more before a failure
//! notification goes out so the link in it already resolves.

use anyhow::Result;
use gantry_core::domain::artifact::{ArtifactRecord, ReportRecord, TestSummary};
use gantry_core::domain::log::{LogEntry, LogLevel};
use gantry_core::domain::pipeline::{PipelineDefinition, StageDefinition, Step};
use gantry_core::domain::run::{
    RunContext, RunRecord, RunStatus, StageFailure, StageRecord, StageStatus,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::artifacts::{archive_files, resolve_pattern};
use crate::executor::{CommandExecutor, ExecError, Invocation, TIMEOUT_EXIT_CODE};
use crate::expand::{expand, overlay};
use crate::notifier::{Notification, Notifier};
use crate::reports::collect_reports;
use crate::service::LogBufferService;
use crate::store::RunStore;

/// Exit code recorded when a command could not be started
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Why a step did not succeed
#[derive(Debug, Error)]
pub enum StepError {
    #[error("command exited with code {0}")]
    Command(i32),

    #[error("command timed out")]
    Timeout,

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("no files match '{0}'")]
    NoArtifacts(String),

    #[error("'{pattern}' matches {count} files but an exported artifact must be unique")]
    AmbiguousArtifact { pattern: String, count: usize },

    #[error("no test reports match '{0}'")]
    NoReports(String),

    #[error("{0:#}")]
    Builtin(anyhow::Error),
}

impl StepError {
    /// Exit code recorded for the failing stage
    pub fn exit_code(&self) -> i32 {
        match self {
            StepError::Command(code) => *code,
            StepError::Timeout => TIMEOUT_EXIT_CODE,
            StepError::Exec(_) => SPAWN_FAILURE_EXIT_CODE,
            _ => 1,
        }
    }
}

/// What a stage produced, applied to the run record once the stage is over
#[derive(Default)]
struct StageOutcome {
    error: Option<StepError>,
    artifacts: Vec<ArtifactRecord>,
    reports: Vec<ReportRecord>,
    exports: BTreeMap<String, String>,
}

/// State shared by the steps of one stage
struct StageScope<'a> {
    context: &'a RunContext,
    cwd: PathBuf,
    vars: BTreeMap<String, String>,
    limit: Option<Duration>,
    deadline: Option<Instant>,
    outcome: StageOutcome,
}

impl StageScope<'_> {
    fn restart_clock(&mut self) {
        self.deadline = self.limit.map(|limit| Instant::now() + limit);
    }

    /// Time left before the stage times out
    fn remaining(&self) -> Result<Option<Duration>, StepError> {
        match self.deadline {
            None => Ok(None),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Err(StepError::Timeout)
                } else {
                    Ok(Some(left))
                }
            }
        }
    }
}

/// Executes pipeline definitions against a workspace
pub struct StageRunner {
    executor: Arc<dyn CommandExecutor>,
    notifier: Arc<dyn Notifier>,
    log: Arc<dyn LogBufferService>,
    store: RunStore,
    default_timeout: Option<Duration>,
}

impl StageRunner {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        notifier: Arc<dyn Notifier>,
        log: Arc<dyn LogBufferService>,
        store: RunStore,
    ) -> Self {
        Self {
            executor,
            notifier,
            log,
            store,
            default_timeout: None,
        }
    }

    /// Timeout for stages that do not declare one
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Returns true if a push to `branch` should start a run of `definition`
    pub fn check_trigger(definition: &PipelineDefinition, branch: Option<&str>) -> bool {
        let matched = definition.trigger.matches(branch);
        if !matched {
            debug!(
                "Branch {:?} does not match trigger {:?}",
                branch, definition.trigger.branch
            );
        }
        matched
    }

    /// Records a run that was not started because the trigger did not match
    pub fn skip(&self, definition: &PipelineDefinition, context: &RunContext) -> Result<RunRecord> {
        let mut record = RunRecord::start(&definition.name, &definition.stage_names(), context);
        self.log.info(format!(
            "Branch '{}' does not match trigger branch '{}', nothing to do",
            context.branch.as_deref().unwrap_or_default(),
            definition.trigger.branch.as_deref().unwrap_or_default()
        ));
        record.finish(RunStatus::Skipped);
        self.store.reset(context.build_number)?;
        self.persist(&record)?;
        Ok(record)
    }

    /// Runs every stage of `definition`
    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        context: &RunContext,
    ) -> Result<RunRecord> {
        self.run_until(definition, context, std::future::pending::<()>())
            .await
    }

    /// Runs every stage of `definition` unless `abort` completes first
    ///
    /// An abort kills the running command, leaves the rest of the run
    /// unexecuted (post actions included) and sends no notification.
    pub async fn run_until<A>(
        &self,
        definition: &PipelineDefinition,
        context: &RunContext,
        abort: A,
    ) -> Result<RunRecord>
    where
        A: Future<Output = ()>,
    {
        tokio::pin!(abort);

        let mut record = RunRecord::start(&definition.name, &definition.stage_names(), context);
        self.store.reset(context.build_number)?;
        self.store.save(&record)?;

        info!(
            "Starting {} #{} - pipeline '{}'",
            context.job_name, context.build_number, definition.name
        );
        self.log.info(format!(
            "Starting pipeline: {} ({} #{})",
            definition.name, context.job_name, context.build_number
        ));

        let pipeline_vars = overlay(&context.variables(), &definition.environment);
        let mut exports = BTreeMap::new();
        let mut aborted_in = None;

        for (idx, stage) in definition.stages.iter().enumerate() {
            info!(
                "Executing stage {}/{}: {}",
                idx + 1,
                definition.stages.len(),
                stage.name
            );
            self.log.info(format!("Starting stage: {}", stage.name));
            update_stage(&mut record, &stage.name, |s| {
                s.status = StageStatus::Running;
                s.started_at = Some(chrono::Utc::now());
            });

            let vars = stage_variables(&pipeline_vars, &exports, stage);
            let outcome = tokio::select! {
                outcome = self.run_stage(stage, vars, context) => Some(outcome),
                _ = &mut abort => None,
            };

            let Some(outcome) = outcome else {
                update_stage(&mut record, &stage.name, |s| {
                    s.status = StageStatus::Failed;
                    s.completed_at = Some(chrono::Utc::now());
                });
                aborted_in = Some(stage.name.clone());
                break;
            };

            record.artifacts.extend(outcome.artifacts);
            record.reports.extend(outcome.reports);
            exports.extend(outcome.exports);

            let failed = match outcome.error {
                None => {
                    update_stage(&mut record, &stage.name, |s| {
                        s.status = StageStatus::Succeeded;
                        s.completed_at = Some(chrono::Utc::now());
                        s.exit_code = Some(0);
                    });
                    self.log.info(format!("Stage '{}' completed", stage.name));
                    false
                }
                Some(err) => {
                    let exit_code = err.exit_code();
                    error!("Stage '{}' failed: {}", stage.name, err);
                    self.log
                        .error(format!("Stage '{}' failed: {}", stage.name, err));
                    update_stage(&mut record, &stage.name, |s| {
                        s.status = StageStatus::Failed;
                        s.completed_at = Some(chrono::Utc::now());
                        s.exit_code = Some(exit_code);
                    });
                    record.failure = Some(StageFailure {
                        stage: stage.name.clone(),
                        exit_code,
                        message: err.to_string(),
                    });
                    true
                }
            };

            self.persist(&record)?;
            if failed {
                break;
            }
        }

        if let Some(stage) = aborted_in {
            warn!("Run aborted during stage '{}'", stage);
            self.log
                .error(format!("Run aborted during stage '{}'", stage));
            record.finish(RunStatus::Aborted);
        } else if let Some(failure) = record.failure.clone() {
            record.finish(RunStatus::Failed);
            self.log.error(format!(
                "Pipeline failed at stage '{}' with exit code {}",
                failure.stage, failure.exit_code
            ));
            self.flush_log(record.build_number)?;
            self.notify_failure(&mut record, context).await;
        } else {
            record.finish(RunStatus::Succeeded);
            info!("{} #{} completed successfully", context.job_name, context.build_number);
            self.log.info("Pipeline completed successfully".to_string());
        }

        self.persist(&record)?;
        Ok(record)
    }

    /// Runs a stage body followed by its `post.always` steps
    async fn run_stage(
        &self,
        stage: &StageDefinition,
        vars: BTreeMap<String, String>,
        context: &RunContext,
    ) -> StageOutcome {
        let cwd = stage_dir(context, stage, &vars);
        let mut scope = StageScope {
            context,
            cwd,
            vars,
            limit: stage
                .timeout_seconds
                .map(Duration::from_secs)
                .or(self.default_timeout),
            deadline: None,
            outcome: StageOutcome::default(),
        };

        if let Err(e) = std::fs::create_dir_all(&scope.cwd) {
            scope.outcome.error = Some(StepError::Builtin(anyhow::anyhow!(
                "Failed to create directory {}: {}",
                scope.cwd.display(),
                e
            )));
            return scope.outcome;
        }

        scope.restart_clock();
        for step in &stage.steps {
            if let Err(e) = self.run_step(step, &mut scope).await {
                scope.outcome.error = Some(e);
                break;
            }
        }

        if !stage.post.always.is_empty() {
            self.log
                .info(format!("Running post actions for stage: {}", stage.name));
            scope.restart_clock();
            for step in &stage.post.always {
                if let Err(e) = self.run_step(step, &mut scope).await {
                    self.log.error(format!("Post action failed: {}", e));
                    // The body's failure, if any, is the one that counts.
                    if scope.outcome.error.is_none() {
                        scope.outcome.error = Some(e);
                    }
                    break;
                }
            }
        }

        scope.outcome
    }

    async fn run_step(&self, step: &Step, scope: &mut StageScope<'_>) -> Result<(), StepError> {
        debug!("Running step: {}", step.describe());

        match step {
            Step::Sh { command } => {
                let command = expand(command, &scope.vars);
                self.log.info(format!("+ {}", command));
                self.run_command(command, scope).await
            }
            Step::Echo { message } => {
                self.log.info(expand(message, &scope.vars));
                Ok(())
            }
            Step::Checkout { url, branch } => {
                let url = expand(url, &scope.vars);
                let branch = expand(branch, &scope.vars);
                self.log
                    .info(format!("Checking out '{}' from {}", branch, url));
                self.run_command(checkout_command(&url, &branch), scope)
                    .await
            }
            Step::Archive {
                pattern,
                fingerprint,
                export,
            } => {
                self.archive(pattern, *fingerprint, export.as_deref(), scope)
                    .await
            }
            Step::Publish {
                pattern,
                allow_empty,
            } => self.publish(pattern, *allow_empty, scope).await,
        }
    }

    async fn run_command(&self, command: String, scope: &StageScope<'_>) -> Result<(), StepError> {
        let invocation = Invocation {
            command,
            cwd: scope.cwd.clone(),
            env: scope.vars.clone(),
            timeout: scope.remaining()?,
        };

        let outcome = self
            .executor
            .execute(&invocation, self.log.as_ref())
            .await?;

        if outcome.timed_out {
            return Err(StepError::Timeout);
        }
        if outcome.exit_code != 0 {
            return Err(StepError::Command(outcome.exit_code));
        }
        Ok(())
    }

    /// Workspace files matching `pattern`, outside the state directory
    async fn resolve(&self, pattern: &str, workspace: &Path) -> Result<Vec<PathBuf>, StepError> {
        let workspace = workspace.to_path_buf();
        let pattern = pattern.to_string();
        let exclude = self.store.root().to_path_buf();
        blocking(move || resolve_pattern(&workspace, &pattern, &exclude)).await
    }

    async fn archive(
        &self,
        pattern: &str,
        fingerprint: bool,
        export: Option<&str>,
        scope: &mut StageScope<'_>,
    ) -> Result<(), StepError> {
        let pattern = expand(pattern, &scope.vars);
        let workspace = scope.context.workspace.clone();

        let files = self.resolve(&pattern, &workspace).await?;
        if files.is_empty() {
            return Err(StepError::NoArtifacts(pattern));
        }
        if export.is_some() && files.len() != 1 {
            return Err(StepError::AmbiguousArtifact {
                pattern,
                count: files.len(),
            });
        }

        let exported_path = workspace.join(&files[0]).display().to_string();
        let archive_dir = self.store.archive_dir(scope.context.build_number);
        let records = blocking(move || archive_files(&workspace, &files, &archive_dir, fingerprint))
            .await?;

        for record in &records {
            match &record.fingerprint {
                Some(fp) => self.log.info(format!(
                    "Archived {} ({} bytes, sha256 {})",
                    record.path, record.size, fp
                )),
                None => self
                    .log
                    .info(format!("Archived {} ({} bytes)", record.path, record.size)),
            }
        }

        if let Some(name) = export {
            self.log.info(format!("Exported {}={}", name, exported_path));
            scope.vars.insert(name.to_string(), exported_path.clone());
            scope.outcome.exports.insert(name.to_string(), exported_path);
        }

        scope.outcome.artifacts.extend(records);
        Ok(())
    }

    async fn publish(
        &self,
        pattern: &str,
        allow_empty: bool,
        scope: &mut StageScope<'_>,
    ) -> Result<(), StepError> {
        let pattern = expand(pattern, &scope.vars);
        let workspace = scope.context.workspace.clone();

        let files = self.resolve(&pattern, &workspace).await?;
        if files.is_empty() {
            if allow_empty {
                self.log.add_entry(LogEntry::now(
                    LogLevel::Warning,
                    format!("No test reports match '{}'", pattern),
                ));
                return Ok(());
            }
            return Err(StepError::NoReports(pattern));
        }

        let reports = blocking(move || collect_reports(&workspace, &files)).await?;
        let total: TestSummary = reports.iter().map(|r| r.summary).sum();

        self.log.info(format!(
            "Test results: {} tests, {} failures, {} errors, {} skipped ({} files)",
            total.tests,
            total.failures,
            total.errors,
            total.skipped,
            reports.len()
        ));
        if total.has_failures() {
            self.log.add_entry(LogEntry::now(
                LogLevel::Warning,
                format!(
                    "{} failing tests reported",
                    total.failures + total.errors
                ),
            ));
        }

        scope.outcome.reports.extend(reports);
        Ok(())
    }

    async fn notify_failure(&self, record: &mut RunRecord, context: &RunContext) {
        let log_url = match &context.build_url {
            Some(url) if url.ends_with('/') => format!("{}console", url),
            Some(url) => format!("{}/console", url),
            None => self
                .store
                .console_log_path(record.build_number)
                .display()
                .to_string(),
        };

        let notification = Notification::failure(record, log_url);
        match self.notifier.notify(&notification).await {
            Ok(()) => {
                record.notified = true;
                self.log
                    .info(format!("Failure notification sent: {}", notification.subject));
            }
            Err(e) => {
                warn!("Failed to send failure notification: {}", e);
                self.log
                    .error(format!("Failed to send failure notification: {}", e));
            }
        }
    }

    /// Saves the record and moves the buffered console log to disk
    fn persist(&self, record: &RunRecord) -> Result<()> {
        self.store.save(record)?;
        self.flush_log(record.build_number)
    }

    fn flush_log(&self, build_number: u64) -> Result<()> {
        let entries = self.log.drain();
        self.store.write_console_log(build_number, &entries)?;
        Ok(())
    }
}

/// Runs filesystem work (globbing, copying, hashing) off the async workers
async fn blocking<T, F>(work: F) -> Result<T, StepError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StepError::Builtin(e.into()))?
        .map_err(StepError::Builtin)
}

fn update_stage<F>(record: &mut RunRecord, name: &str, f: F)
where
    F: FnOnce(&mut StageRecord),
{
    if let Some(stage) = record.stage_mut(name) {
        f(stage);
    }
}

/// Variables visible to a stage
///
/// Stage `env` values may refer to pipeline variables and earlier exports;
/// exports win over everything else.
fn stage_variables(
    pipeline_vars: &BTreeMap<String, String>,
    exports: &BTreeMap<String, String>,
    stage: &StageDefinition,
) -> BTreeMap<String, String> {
    let mut visible = pipeline_vars.clone();
    visible.extend(exports.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut vars = overlay(&visible, &stage.env);
    vars.extend(exports.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars
}

/// Working directory of a stage; relative directories live in the workspace
fn stage_dir(context: &RunContext, stage: &StageDefinition, vars: &BTreeMap<String, String>) -> PathBuf {
    match &stage.dir {
        None => context.workspace.clone(),
        Some(dir) => {
            let dir = expand(dir, vars);
            let path = Path::new(&dir);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                context.workspace.join(path)
            }
        }
    }
}

/// Fetches `branch` of `url` into the current directory
///
/// Works in a fresh or a previously checked out workspace.
fn checkout_command(url: &str, branch: &str) -> String {
    let remote = format!("refs/remotes/origin/{}", branch);
    format!(
        "git init -q && git fetch --no-tags {} {} && git checkout -q -f -B {} {}",
        shell_quote(url),
        shell_quote(&format!("+refs/heads/{}:{}", branch, remote)),
        shell_quote(branch),
        shell_quote(&remote),
    )
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
