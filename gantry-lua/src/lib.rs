//! Gantry Lua Infrastructure
//!
//! Pipelines are declared as Lua files evaluated in a restricted sandbox.
//! This crate provides:
//! - Module trait and registry for Lua modules
//! - The sandbox, with the `pipeline` helper module always available
//! - Core module implementations (`env`, `log`)
//! - Parsing of a pipeline file into a [`PipelineDefinition`]

pub mod module;
pub mod modules;
pub mod parser;
pub mod sandbox;

pub use module::{GantryModule, ModuleMetadata, ModuleRegistry};
pub use modules::{EnvModule, LogModule, LogSink, VarProvider};
pub use parser::parse_pipeline_definition;
pub use sandbox::{create_sandbox, pipeline_stubs};

pub use gantry_core::domain::pipeline::{PipelineDefinition, StageDefinition, Step};
