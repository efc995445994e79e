//! Command execution
//!
//! Every `sh` and `checkout` step ends up here as an [`Invocation`]. The
//! executor blocks the run until the shell exits; output lines go to the
//! run's console log as they arrive.
//!
//! On unix each command runs in its own process group. A timeout, or
//! dropping the execution (an aborted run), kills the whole group so no
//! subshell or pipeline member outlives the stage.

use async_trait::async_trait;
use gantry_core::domain::log::{LogEntry, LogLevel};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::service::LogBufferService;

/// Exit code reported when a command exceeds its timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long output is still read after the shell exited
///
/// Background processes may keep the pipes open indefinitely.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// A fully expanded command ready to run
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub command: String,
    pub cwd: PathBuf,
    /// Complete child environment overlay (run, pipeline and stage variables)
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

/// How a command finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            timed_out: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            exit_code: TIMEOUT_EXIT_CODE,
            timed_out: true,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Errors raised before a command produced an exit status
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn '{shell}': {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("working directory {0} does not exist")]
    MissingDirectory(PathBuf),

    #[error("failed to wait for command: {0}")]
    Wait(#[source] std::io::Error),
}

/// Runs commands on behalf of the stage runner
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs `invocation` to completion, streaming its output into `log`
    async fn execute(
        &self,
        invocation: &Invocation,
        log: &dyn LogBufferService,
    ) -> Result<CommandOutcome, ExecError>;
}

/// Executes commands as `<shell> -c <command>`
pub struct ShellExecutor {
    shell: String,
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(
        &self,
        invocation: &Invocation,
        log: &dyn LogBufferService,
    ) -> Result<CommandOutcome, ExecError> {
        if !invocation.cwd.is_dir() {
            return Err(ExecError::MissingDirectory(invocation.cwd.clone()));
        }

        debug!(
            "Executing in {}: {}",
            invocation.cwd.display(),
            invocation.command
        );

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&invocation.command)
            .current_dir(&invocation.cwd)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            shell: self.shell.clone(),
            source,
        })?;
        let mut group = ProcessGroup::new(child.id());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = {
            let run = async {
                let output = async {
                    tokio::join!(
                        pump(stdout, LogLevel::Info, log),
                        pump(stderr, LogLevel::Warning, log)
                    );
                };
                tokio::pin!(output);

                let mut drained = false;
                let status = loop {
                    tokio::select! {
                        status = child.wait() => break status,
                        _ = &mut output, if !drained => drained = true,
                    }
                };

                if !drained && tokio::time::timeout(OUTPUT_DRAIN, &mut output).await.is_err() {
                    debug!("Output still open after the shell exited, no longer reading it");
                }
                status
            };

            match invocation.timeout {
                Some(limit) => tokio::time::timeout(limit, run).await.ok(),
                None => Some(run.await),
            }
        };

        match finished {
            Some(status) => {
                // Background processes started by the command keep running.
                group.release();
                let status = status.map_err(ExecError::Wait)?;
                let exit_code = exit_code(status);
                debug!("Command exited with code {}", exit_code);
                Ok(CommandOutcome::exited(exit_code))
            }
            None => {
                warn!(
                    "Command timed out after {:?}: {}",
                    invocation.timeout, invocation.command
                );
                group.kill();
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out command: {}", e);
                }
                log.add_entry(LogEntry::now(
                    LogLevel::Error,
                    format!(
                        "Command timed out after {}s",
                        invocation.timeout.map(|t| t.as_secs()).unwrap_or_default()
                    ),
                ));
                Ok(CommandOutcome::timed_out())
            }
        }
    }
}

/// Process group of a running command, killed when dropped unless released
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    /// Sends SIGKILL to every process in the group
    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }

    fn release(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => debug!("Killed process group {}", pgid),
        // Everything in the group already exited.
        Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) {}

/// Forwards every line of `reader` into the console log
///
/// Reads raw bytes so invalid UTF-8 never stops the pipe from draining.
async fn pump<R>(reader: Option<R>, level: LogLevel, log: &dyn LogBufferService)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                log.add_entry(LogEntry::now(level, line.trim_end_matches(['\r', '\n'])));
            }
            Err(e) => {
                warn!("Failed to read command output: {}", e);
                break;
            }
        }
    }
}

/// Exit code of a finished process; `128 + signal` when killed by a signal
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::InMemoryLogBuffer;

    fn invocation(command: &str, cwd: PathBuf) -> Invocation {
        Invocation {
            command: command.to_string(),
            cwd,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_shell_executor_success_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = InMemoryLogBuffer::new();

        let outcome = ShellExecutor::default()
            .execute(&invocation("echo hello; echo oops >&2", dir.path().into()), &log)
            .await
            .unwrap();

        assert!(outcome.success());
        let entries = log.snapshot();
        assert!(
            entries
                .iter()
                .any(|e| e.level == LogLevel::Info && e.message == "hello")
        );
        assert!(
            entries
                .iter()
                .any(|e| e.level == LogLevel::Warning && e.message == "oops")
        );
    }

    #[tokio::test]
    async fn test_shell_executor_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let log = InMemoryLogBuffer::new();

        let outcome = ShellExecutor::default()
            .execute(&invocation("exit 3", dir.path().into()), &log)
            .await
            .unwrap();

        assert_eq!(outcome, CommandOutcome::exited(3));
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_shell_executor_passes_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let log = InMemoryLogBuffer::new();

        let mut inv = invocation("test -f marker.txt && echo \"$APP_NAME\"", dir.path().into());
        inv.env.insert("APP_NAME".to_string(), "webapp".to_string());

        let outcome = ShellExecutor::default().execute(&inv, &log).await.unwrap();

        assert!(outcome.success());
        assert!(log.snapshot().iter().any(|e| e.message == "webapp"));
    }

    #[tokio::test]
    async fn test_shell_executor_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let log = InMemoryLogBuffer::new();

        let mut inv = invocation("sleep 5", dir.path().into());
        inv.timeout = Some(Duration::from_millis(100));

        let outcome = ShellExecutor::default().execute(&inv, &log).await.unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_subshells() {
        let dir = tempfile::tempdir().unwrap();
        let log = InMemoryLogBuffer::new();

        let mut inv = invocation("(sleep 1; touch marker); true", dir.path().into());
        inv.timeout = Some(Duration::from_millis(200));

        let outcome = ShellExecutor::default().execute(&inv, &log).await.unwrap();
        assert!(outcome.timed_out);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("marker").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_execution_kills_subshells() {
        let dir = tempfile::tempdir().unwrap();
        let log = InMemoryLogBuffer::new();
        let inv = invocation("(sleep 1; touch marker) | cat", dir.path().into());

        let executor = ShellExecutor::default();
        let result =
            tokio::time::timeout(Duration::from_millis(200), executor.execute(&inv, &log)).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_background_process_does_not_hold_stage_open() {
        let dir = tempfile::tempdir().unwrap();
        let log = InMemoryLogBuffer::new();

        let started = std::time::Instant::now();
        let outcome = ShellExecutor::default()
            .execute(&invocation("sleep 3 & echo started", dir.path().into()), &log)
            .await
            .unwrap();

        assert!(outcome.success());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(log.snapshot().iter().any(|e| e.message == "started"));
    }

    #[tokio::test]
    async fn test_shell_executor_missing_directory() {
        let log = InMemoryLogBuffer::new();
        let result = ShellExecutor::default()
            .execute(
                &invocation("true", PathBuf::from("/definitely/not/here")),
                &log,
            )
            .await;

        assert!(matches!(result, Err(ExecError::MissingDirectory(_))));
    }
}
