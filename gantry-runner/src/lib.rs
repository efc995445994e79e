//! Gantry Runner
//!
//! Executes a pipeline definition on a single agent, one stage at a time.
//!
//! Architecture:
//! - Configuration: run identity and tool paths from environment or defaults
//! - Executor: spawns stage commands through the shell
//! - Artifacts/Reports: built-in archive and test-report steps
//! - Notifier: failure notification by mail or webhook
//! - Store: run records and console logs on disk
//! - Service: the stage runner and the console log buffer

pub mod artifacts;
pub mod config;
pub mod executor;
pub mod expand;
pub mod notifier;
pub mod reports;
pub mod service;
pub mod sinks;
pub mod store;

pub use config::RunnerConfig;
pub use executor::{CommandExecutor, Invocation, ShellExecutor};
pub use notifier::{Notification, Notifier, NotifyError};
pub use service::{InMemoryLogBuffer, LogBufferService, StageRunner};
pub use sinks::load_pipeline;
pub use store::RunStore;
