//! Gantry Core
//!
//! Core types for the Gantry stage runner.
//!
//! This crate contains the domain types shared between the Lua definition
//! parser (which produces them), the runner (which executes and records them)
//! and the CLI (which displays them).

pub mod domain;

pub use domain::artifact::{ArtifactRecord, ReportRecord, TestSummary};
pub use domain::log::{LogEntry, LogLevel};
pub use domain::pipeline::{NotifyConfig, PipelineDefinition, PostActions, StageDefinition, Step, Trigger};
pub use domain::run::{RunContext, RunRecord, RunStatus, StageFailure, StageRecord, StageStatus};
