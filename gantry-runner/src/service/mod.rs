//! Service layer
//!
//! The stage runner and the console log buffer it writes to. Both are
//! trait-based so the CLI and tests can plug in their own collaborators.

mod log_buffer;
mod stage_runner;

#[cfg(test)]
pub(crate) mod fakes;

pub use log_buffer::{InMemoryLogBuffer, LogBufferService};
pub use stage_runner::{StageRunner, StepError};
