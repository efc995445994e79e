//! Failure notification
//!
//! A failed run sends exactly one [`Notification`]. Where it goes depends on
//! the pipeline's `notify` table: mail through the local sendmail, a JSON
//! webhook, both, or only the runner's own log when nothing is configured.

use async_trait::async_trait;
use gantry_core::domain::pipeline::NotifyConfig;
use gantry_core::domain::run::RunRecord;
use reqwest::Client;
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;

/// Upper bound on delivering one notification to one target
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors delivering a notification
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write message to '{command}': {source}")]
    Write {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with status {code}")]
    MailExit { command: String, code: i32 },

    #[error("'{command}' did not finish within {}s", .timeout.as_secs_f32())]
    MailTimeout { command: String, timeout: Duration },

    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("every notification target failed: {}", .0.join("; "))]
    AllFailed(Vec<String>),
}

/// What a failure notification says
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub pipeline: String,
    pub job_name: String,
    pub build_number: u64,
    pub status: String,
    pub stage: Option<String>,
    pub exit_code: Option<i32>,
    /// Where the console output of the run can be read
    pub log_url: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    /// Describes a failed run
    ///
    /// `log_url` is `<BUILD_URL>console` when the run has a build URL, the
    /// local console log path otherwise.
    pub fn failure(run: &RunRecord, log_url: impl Into<String>) -> Self {
        let log_url = log_url.into();
        let subject = format!("Pipeline failed: {} #{}", run.job_name, run.build_number);

        let mut body = format!(
            "Pipeline '{}' failed.\n\nJob: {} #{}\n",
            run.pipeline, run.job_name, run.build_number
        );
        if let Some(failure) = &run.failure {
            body.push_str(&format!(
                "Stage: {}\nExit code: {}\nReason: {}\n",
                failure.stage, failure.exit_code, failure.message
            ));
        }
        body.push_str(&format!("\nConsole output: {}\n", log_url));

        Self {
            pipeline: run.pipeline.clone(),
            job_name: run.job_name.clone(),
            build_number: run.build_number,
            status: run.status.to_string(),
            stage: run.failure.as_ref().map(|f| f.stage.clone()),
            exit_code: run.failure.as_ref().map(|f| f.exit_code),
            log_url,
            subject,
            body,
        }
    }
}

/// Delivers failure notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Pipes an RFC 5322 message to `<sendmail> -t`
pub struct MailNotifier {
    sendmail: String,
    from: String,
    to: String,
    timeout: Duration,
}

impl MailNotifier {
    pub fn new(sendmail: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            sendmail: sendmail.into(),
            from: from.into(),
            to: to.into(),
            timeout: NOTIFY_TIMEOUT,
        }
    }

    /// Gives up (and kills sendmail) after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn message(&self, notification: &Notification) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
            header_value(&self.from),
            header_value(&self.to),
            header_value(&notification.subject),
            chrono::Utc::now().to_rfc2822(),
            notification.body.replace('\n', "\r\n"),
        )
    }
}

#[async_trait]
impl Notifier for MailNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        debug!("Sending failure mail to {} via {}", self.to, self.sendmail);

        let mut child = Command::new(&self.sendmail)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| NotifyError::Spawn {
                command: self.sendmail.clone(),
                source,
            })?;

        let message = self.message(notification);
        let stdin = child.stdin.take();
        let deliver = async {
            if let Some(mut stdin) = stdin {
                let write = async {
                    stdin.write_all(message.as_bytes()).await?;
                    stdin.shutdown().await
                };
                write.await.map_err(|source| NotifyError::Write {
                    command: self.sendmail.clone(),
                    source,
                })?;
            }
            child.wait().await.map_err(|source| NotifyError::Spawn {
                command: self.sendmail.clone(),
                source,
            })
        };

        let status = match tokio::time::timeout(self.timeout, deliver).await {
            Ok(status) => status?,
            Err(_) => {
                // Dropping the child kills it.
                return Err(NotifyError::MailTimeout {
                    command: self.sendmail.clone(),
                    timeout: self.timeout,
                });
            }
        };

        if !status.success() {
            return Err(NotifyError::MailExit {
                command: self.sendmail.clone(),
                code: status.code().unwrap_or(-1),
            });
        }

        info!("Failure mail sent to {}", self.to);
        Ok(())
    }
}

/// POSTs the notification as JSON
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        Self::with_timeout(url, NOTIFY_TIMEOUT)
    }

    /// Fails a request that has not completed within `timeout`
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        debug!("Posting failure notification to {}", self.url);

        let response = self.client.post(&self.url).json(notification).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status { status, body });
        }

        info!("Failure notification posted to {}", self.url);
        Ok(())
    }
}

/// Fans a notification out to several targets
///
/// Succeeds when at least one target accepted it.
pub struct CompositeNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl CompositeNotifier {
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut errors = Vec::new();
        for target in &self.targets {
            if let Err(e) = target.notify(notification).await {
                warn!("Notification target failed: {}", e);
                errors.push(e.to_string());
            }
        }

        if !self.targets.is_empty() && errors.len() == self.targets.len() {
            return Err(NotifyError::AllFailed(errors));
        }
        Ok(())
    }
}

/// Writes the notification to the runner log only
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        warn!(
            "{} (no notification target configured, see {})",
            notification.subject, notification.log_url
        );
        Ok(())
    }
}

/// Keeps a header value on one line
fn header_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

/// Builds the notifier for a pipeline's `notify` table
pub fn from_config(
    notify: &NotifyConfig,
    config: &RunnerConfig,
) -> Result<Arc<dyn Notifier>, NotifyError> {
    let mut targets: Vec<Arc<dyn Notifier>> = Vec::new();

    if let Some(to) = &notify.email {
        targets.push(Arc::new(MailNotifier::new(
            config.sendmail.clone(),
            config.mail_from.clone(),
            to.clone(),
        )));
    }
    if let Some(url) = &notify.webhook {
        targets.push(Arc::new(WebhookNotifier::new(url.clone())?));
    }

    Ok(match targets.len() {
        0 => Arc::new(LogNotifier),
        1 => targets.remove(0),
        _ => Arc::new(CompositeNotifier::new(targets)),
    })
}
