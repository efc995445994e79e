//! Lua module backends for the runner
//!
//! Connect the `log` and `env` modules seen by a pipeline file to the run's
//! console log and variables, and load the definition with them.

use anyhow::{Context, Result};
use gantry_core::domain::log::{LogEntry, LogLevel};
use gantry_core::domain::pipeline::PipelineDefinition;
use gantry_lua::{EnvModule, LogModule, LogSink, ModuleRegistry, VarProvider, parse_pipeline_definition};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::service::LogBufferService;

/// Log sink that writes into the run's console log
pub struct BufferedLogSink {
    buffer: Arc<dyn LogBufferService>,
}

impl BufferedLogSink {
    pub fn new(buffer: Arc<dyn LogBufferService>) -> Self {
        Self { buffer }
    }
}

impl LogSink for BufferedLogSink {
    fn write(&mut self, level: LogLevel, message: &str) {
        self.buffer.add_entry(LogEntry::now(level, message));
    }
}

/// Run variables (context plus `--param` values) for the `env` module
pub struct RunVarProvider {
    vars: BTreeMap<String, String>,
}

impl RunVarProvider {
    pub fn new(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }
}

impl VarProvider for RunVarProvider {
    fn get(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }
}

/// Registry with the `log` and `env` modules wired to this run
pub fn run_registry(
    vars: BTreeMap<String, String>,
    log_buffer: Arc<dyn LogBufferService>,
) -> Result<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();
    registry.register(LogModule::new(BufferedLogSink::new(log_buffer)))?;
    registry.register(EnvModule::new(RunVarProvider::new(vars)))?;
    Ok(registry)
}

/// Reads and evaluates a pipeline file
pub fn load_pipeline(
    path: &Path,
    vars: BTreeMap<String, String>,
    log_buffer: Arc<dyn LogBufferService>,
) -> Result<PipelineDefinition> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;

    let registry = run_registry(vars, log_buffer)?;
    let definition = parse_pipeline_definition(&source, &registry)
        .with_context(|| format!("Invalid pipeline file {}", path.display()))?;

    debug!(
        "Loaded pipeline '{}' with {} stages",
        definition.name,
        definition.stages.len()
    );
    Ok(definition)
}
