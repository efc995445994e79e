//! Pipeline domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pipeline definition
///
/// Produced by the Lua parser and consumed by the stage runner. Stages run
/// strictly in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub trigger: Trigger,
    /// Pipeline-wide variables, visible to every stage
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub notify: NotifyConfig,
    pub stages: Vec<StageDefinition>,
}

impl PipelineDefinition {
    /// Looks up a stage by name
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Conditions under which a run starts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Only pushes to this branch start a run; `None` accepts any branch
    pub branch: Option<String>,
}

impl Trigger {
    /// Returns true if a push to `branch` should start a run
    ///
    /// A run requested without branch information is always accepted.
    pub fn matches(&self, branch: Option<&str>) -> bool {
        match (&self.branch, branch) {
            (Some(expected), Some(actual)) => {
                expected == actual || actual.strip_prefix("refs/heads/") == Some(expected.as_str())
            }
            _ => true,
        }
    }
}

/// Failure notification targets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub email: Option<String>,
    pub webhook: Option<String>,
}

impl NotifyConfig {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.webhook.is_none()
    }
}

/// A named unit of pipeline work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Working directory, relative to the workspace unless absolute
    pub dir: Option<String>,
    /// Environment overlay applied on top of the pipeline environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub post: PostActions,
    pub timeout_seconds: Option<u64>,
}

/// Actions attached to a stage that run after its steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostActions {
    /// Runs whether the stage succeeded or failed
    pub always: Vec<Step>,
}

/// A single step inside a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// Run a shell command
    Sh { command: String },
    /// Write a message to the console log
    Echo { message: String },
    /// Fetch sources with git into the stage directory
    Checkout { url: String, branch: String },
    /// Persist files matching `pattern` and fingerprint them
    Archive {
        pattern: String,
        fingerprint: bool,
        /// Variable that receives the absolute path of the single match
        export: Option<String>,
    },
    /// Publish JUnit test reports matching `pattern`
    Publish { pattern: String, allow_empty: bool },
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Sh { .. } => "sh",
            Step::Echo { .. } => "echo",
            Step::Checkout { .. } => "checkout",
            Step::Archive { .. } => "archive",
            Step::Publish { .. } => "publish",
        }
    }

    /// Short human readable description used in logs
    pub fn describe(&self) -> String {
        match self {
            Step::Sh { command } => command.clone(),
            Step::Echo { message } => format!("echo {}", message),
            Step::Checkout { url, branch } => format!("checkout {} ({})", url, branch),
            Step::Archive { pattern, .. } => format!("archive {}", pattern),
            Step::Publish { pattern, .. } => format!("publish {}", pattern),
        }
    }
}
