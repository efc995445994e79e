//! Core modules available to pipeline files
//!
//! Each module is generic over a small trait so the caller decides where
//! values come from and where messages go:
//! - Runner: run variables and the run's console log
//! - CLI validation: process environment and stderr

pub mod env;
pub mod log;

pub use env::{EnvModule, VarProvider};
pub use log::{LogModule, LogSink};
