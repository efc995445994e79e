//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod init;
mod run;
mod runs;
mod validate;

pub use init::InitCommands;
pub use run::RunArgs;
pub use runs::RunsCommands;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;
use std::process::ExitCode;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline file in a workspace
    Run(RunArgs),
    /// Check a pipeline file and show its stages
    Validate {
        /// Path to the pipeline file
        file: PathBuf,

        /// Print the parsed definition as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect recorded runs
    Runs {
        /// Workspace whose runs to inspect (default: $WORKSPACE or the current directory)
        #[arg(long)]
        workspace: Option<PathBuf>,

        #[command(subcommand)]
        command: RunsCommands,
    },
    /// Generate starter files
    Init {
        #[command(subcommand)]
        command: InitCommands,
    },
}

/// Routes the command to its handler
///
/// Returns the process exit code; errors are reported by the caller.
pub async fn handle_command(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Run(args) => run::handle_run_command(args).await,
        Commands::Validate { file, json } => validate::handle_validate_command(&file, json),
        Commands::Runs { workspace, command } => {
            runs::handle_runs_command(command, workspace).map(|_| ExitCode::SUCCESS)
        }
        Commands::Init { command } => {
            init::handle_init_command(command).map(|_| ExitCode::SUCCESS)
        }
    }
}

/// Parse a single key=value pair
pub(crate) fn parse_key_val(s: &str) -> Result<(String, String)> {
    let pos = s
        .find('=')
        .ok_or_else(|| anyhow::anyhow!("invalid KEY=value: no `=` found in `{}`", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("DEPLOY_ENV=prod").unwrap(),
            ("DEPLOY_ENV".to_string(), "prod".to_string())
        );
        assert_eq!(
            parse_key_val("OPTS=-e a=b").unwrap(),
            ("OPTS".to_string(), "-e a=b".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
    }
}
