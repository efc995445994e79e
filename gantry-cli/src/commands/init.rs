//! Init command handlers
//!
//! Writes a starter pipeline file, or the Lua language server setup
//! (.luarc.json plus stubs for the `pipeline`, `log` and `env` globals).

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use colored::*;
use gantry_core::domain::log::LogLevel;
use gantry_lua::{EnvModule, LogModule, LogSink, ModuleRegistry, VarProvider, pipeline_stubs};
use std::fs;
use std::path::Path;

const STARTER_PIPELINE: &str = include_str!("../../../demos/webapp/pipeline.lua");

/// Init subcommands
#[derive(Subcommand)]
pub enum InitCommands {
    /// Write a starter pipeline.lua
    Pipeline {
        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: String,

        /// Overwrite an existing pipeline.lua
        #[arg(long)]
        force: bool,
    },
    /// Generate Lua development files (.luarc.json and stubs)
    Lua {
        /// Output directory for generated files
        #[arg(short, long, default_value = ".")]
        output: String,

        /// Generate only .luarc.json
        #[arg(long, conflicts_with = "stubs_only")]
        config_only: bool,

        /// Generate only stub files
        #[arg(long)]
        stubs_only: bool,
    },
}

/// Handle init commands
pub fn handle_init_command(command: InitCommands) -> Result<()> {
    match command {
        InitCommands::Pipeline { output, force } => generate_pipeline(Path::new(&output), force),
        InitCommands::Lua {
            output,
            config_only,
            stubs_only,
        } => generate_lua_dev_files(Path::new(&output), config_only, stubs_only),
    }
}

fn generate_pipeline(output_path: &Path, force: bool) -> Result<()> {
    fs::create_dir_all(output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;

    let path = output_path.join("pipeline.lua");
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    fs::write(&path, STARTER_PIPELINE)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("{}", "✓ Pipeline file generated!".green().bold());
    println!("  {} {}", "Created".green(), path.display());
    println!();
    println!("{}", "Next steps:".bold());
    println!("  1. Adjust the repository URL, commands and notify address");
    println!("  2. Check it with {}", "gantry validate pipeline.lua".cyan());
    println!("  3. Run it with {}", "gantry run pipeline.lua".cyan());

    Ok(())
}

fn generate_lua_dev_files(output_path: &Path, config_only: bool, stubs_only: bool) -> Result<()> {
    if !stubs_only {
        generate_luarc_json(output_path)?;
    }
    if !config_only {
        generate_stub_files(output_path)?;
    }

    println!("{}", "✓ Lua development files generated!".green().bold());
    println!();
    println!("{}", "Next steps:".bold());
    println!("  1. Install Lua Language Server in your editor");
    println!("  2. Open your pipeline file to see autocomplete and type hints");

    Ok(())
}

/// Generate .luarc.json for Lua LSP configuration
fn generate_luarc_json(output_path: &Path) -> Result<()> {
    fs::create_dir_all(output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;
    let luarc_path = output_path.join(".luarc.json");

    let luarc_content = r#"{
  "$schema": "https://raw.githubusercontent.com/sumneko/vscode-lua/master/setting/schema.json",
  "runtime": {
    "version": "Lua 5.4"
  },
  "diagnostics": {
    "globals": ["pipeline", "log", "env"]
  },
  "workspace": {
    "library": [".gantry/stubs"],
    "checkThirdParty": false
  },
  "completion": {
    "callSnippet": "Both"
  }
}
"#;

    fs::write(&luarc_path, luarc_content)
        .with_context(|| format!("Failed to write {}", luarc_path.display()))?;

    println!("  {} .luarc.json", "Created".green());
    Ok(())
}

/// Stubs come from the module implementations themselves
fn generate_stub_files(output_path: &Path) -> Result<()> {
    let stubs_dir = output_path.join(".gantry").join("stubs");
    fs::create_dir_all(&stubs_dir)
        .with_context(|| format!("Failed to create stubs directory {}", stubs_dir.display()))?;

    let mut registry = ModuleRegistry::new();
    registry.register(LogModule::new(NoOpLogSink))?;
    registry.register(EnvModule::new(NoOpVarProvider))?;

    let mut stubs = vec![("pipeline".to_string(), pipeline_stubs())];
    stubs.extend(
        registry
            .modules()
            .iter()
            .map(|module| (module.id().to_string(), module.stubs())),
    );

    for (name, content) in stubs {
        let stub_path = stubs_dir.join(format!("{}.lua", name));
        fs::write(&stub_path, content)
            .with_context(|| format!("Failed to write {}", stub_path.display()))?;
        println!("  {} {}.lua", "Created".green(), name);
    }

    println!(
        "  {} in {}",
        "Stubs ready".green(),
        stubs_dir.display().to_string().cyan()
    );
    Ok(())
}

struct NoOpLogSink;

impl LogSink for NoOpLogSink {
    fn write(&mut self, _level: LogLevel, _message: &str) {}
}

struct NoOpVarProvider;

impl VarProvider for NoOpVarProvider {
    fn get(&self, _name: &str) -> Option<String> {
        None
    }

    fn keys(&self) -> Vec<String> {
        Vec::new()
    }
}
