//! Core domain types
//!
//! Definitions are read once per run and never mutated; run records are
//! built up by the runner while the stages execute and persisted afterwards.

pub mod artifact;
pub mod log;
pub mod pipeline;
pub mod run;
