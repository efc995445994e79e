//! In-memory executor and notifier for stage runner tests

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::executor::{CommandExecutor, CommandOutcome, ExecError, Invocation};
use crate::notifier::{Notification, Notifier, NotifyError};
use crate::service::LogBufferService;

/// Observable executor activity, in order
#[derive(Debug, Clone, PartialEq)]
pub enum ExecEvent {
    Started(String),
    Finished(String),
}

/// Records every invocation and answers with scripted exit codes
///
/// Commands exit 0 unless a registered substring matches.
#[derive(Clone, Default)]
pub struct RecordingExecutor {
    invocations: Arc<Mutex<Vec<Invocation>>>,
    events: Arc<Mutex<Vec<ExecEvent>>>,
    exit_codes: Vec<(String, i32)>,
    timeouts: Vec<String>,
    hangs: Vec<String>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `needle` exit with `code`
    pub fn exit_with(mut self, needle: &str, code: i32) -> Self {
        self.exit_codes.push((needle.to_string(), code));
        self
    }

    /// Commands containing `needle` report a timeout
    pub fn time_out(mut self, needle: &str) -> Self {
        self.timeouts.push(needle.to_string());
        self
    }

    /// Commands containing `needle` never finish
    pub fn hang(mut self, needle: &str) -> Self {
        self.hangs.push(needle.to_string());
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.invocations().into_iter().map(|i| i.command).collect()
    }

    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(
        &self,
        invocation: &Invocation,
        _log: &dyn LogBufferService,
    ) -> Result<CommandOutcome, ExecError> {
        let command = invocation.command.clone();
        self.invocations.lock().unwrap().push(invocation.clone());
        self.events
            .lock()
            .unwrap()
            .push(ExecEvent::Started(command.clone()));

        if self.hangs.iter().any(|n| command.contains(n.as_str())) {
            std::future::pending::<()>().await;
        }

        // Give anything that could run concurrently a chance to interleave.
        tokio::task::yield_now().await;

        let outcome = if self.timeouts.iter().any(|n| command.contains(n.as_str())) {
            CommandOutcome::timed_out()
        } else {
            let code = self
                .exit_codes
                .iter()
                .find(|(n, _)| command.contains(n.as_str()))
                .map_or(0, |(_, code)| *code);
            CommandOutcome::exited(code)
        };

        self.events
            .lock()
            .unwrap()
            .push(ExecEvent::Finished(command));
        Ok(outcome)
    }
}

/// Records notifications; optionally fails every delivery
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        if self.fail {
            return Err(NotifyError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}
