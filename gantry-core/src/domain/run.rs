//! Run domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use super::artifact::{ArtifactRecord, ReportRecord};

/// Identity of a single run, as seen by the external orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub job_name: String,
    pub build_number: u64,
    pub build_url: Option<String>,
    pub workspace: PathBuf,
    /// Branch the triggering push was made to, if known
    pub branch: Option<String>,
}

impl RunContext {
    /// Variables every stage sees, named the way CI servers export them
    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert(
            "WORKSPACE".to_string(),
            self.workspace.display().to_string(),
        );
        vars.insert("JOB_NAME".to_string(), self.job_name.clone());
        vars.insert("BUILD_NUMBER".to_string(), self.build_number.to_string());
        if let Some(url) = &self.build_url {
            vars.insert("BUILD_URL".to_string(), url.clone());
        }
        if let Some(branch) = &self.branch {
            vars.insert("BRANCH_NAME".to_string(), branch.clone());
        }
        vars
    }
}

/// Run execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub pipeline: String,
    pub job_name: String,
    pub build_number: u64,
    pub status: RunStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub stages: Vec<StageRecord>,
    pub artifacts: Vec<ArtifactRecord>,
    pub reports: Vec<ReportRecord>,
    pub failure: Option<StageFailure>,
    /// Whether the failure notification was delivered
    pub notified: bool,
}

impl RunRecord {
    /// Starts a record for `pipeline` with every stage pending
    pub fn start(pipeline: &str, stage_names: &[&str], context: &RunContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline: pipeline.to_string(),
            job_name: context.job_name.clone(),
            build_number: context.build_number,
            status: RunStatus::Running,
            started_at: chrono::Utc::now(),
            completed_at: None,
            stages: stage_names
                .iter()
                .map(|name| StageRecord::pending(name))
                .collect(),
            artifacts: Vec::new(),
            reports: Vec::new(),
            failure: None,
            notified: false,
        }
    }

    /// Marks the record as finished with the given status
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(chrono::Utc::now());
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|s| s.name == name)
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Wall-clock duration, if the run has finished
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }
}

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    /// Stopped by an operator; treated as a hard stop
    Aborted,
    /// The trigger did not match, nothing was executed
    Skipped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCESS",
            RunStatus::Failed => "FAILURE",
            RunStatus::Aborted => "ABORTED",
            RunStatus::Skipped => "SKIPPED",
        };
        f.write_str(label)
    }
}

/// Outcome of one stage within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_code: Option<i32>,
}

impl StageRecord {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::NotRun,
            started_at: None,
            completed_at: None,
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    NotRun,
    Running,
    Succeeded,
    Failed,
}

/// Which stage broke the run and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: String,
    pub exit_code: i32,
    pub message: String,
}
