//! Runner configuration
//!
//! Run identity (workspace, job name, build number, build URL) plus the
//! external tools the runner itself calls (shell, sendmail).

use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::time::Duration;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Workspace root, exclusively owned by the run
    pub workspace: PathBuf,

    /// Job name; falls back to the pipeline name when unset
    pub job_name: Option<String>,

    /// Build number; the next free number in the run store when unset
    pub build_number: Option<u64>,

    /// Base URL of this run on the CI server (e.g., "https://ci.example.com/job/webapp/42/")
    pub build_url: Option<String>,

    /// Where run records, console logs and archived artifacts are kept
    pub state_dir: PathBuf,

    /// Shell used to run stage commands as `<shell> -c <command>`
    pub shell: String,

    /// Mail transfer command, invoked as `<sendmail> -t`
    pub sendmail: String,

    /// Sender address for failure mail
    pub mail_from: String,

    /// Timeout applied to stages that do not declare their own
    pub stage_timeout: Option<Duration>,
}

impl RunnerConfig {
    /// Creates a configuration for `workspace` with defaults
    pub fn new(workspace: PathBuf) -> Self {
        let state_dir = workspace.join(".gantry");
        Self {
            workspace,
            job_name: None,
            build_number: None,
            build_url: None,
            state_dir,
            shell: "sh".to_string(),
            sendmail: "sendmail".to_string(),
            mail_from: "gantry@localhost".to_string(),
            stage_timeout: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Recognized environment variables:
    /// - WORKSPACE (optional, default: current directory)
    /// - JOB_NAME (optional)
    /// - BUILD_NUMBER (optional, must be an integer)
    /// - BUILD_URL (optional)
    /// - GANTRY_STATE_DIR (optional, default: $WORKSPACE/.gantry)
    /// - GANTRY_SHELL (optional, default: sh)
    /// - GANTRY_SENDMAIL (optional, default: sendmail)
    /// - GANTRY_MAIL_FROM (optional, default: gantry@localhost)
    /// - GANTRY_STAGE_TIMEOUT (optional, seconds)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let workspace = match lookup("WORKSPACE").filter(|s| !s.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().context("Failed to determine current directory")?,
        };

        let mut config = Self::new(workspace);

        config.job_name = lookup("JOB_NAME").filter(|s| !s.is_empty());

        config.build_number = lookup("BUILD_NUMBER")
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u64>()
                    .with_context(|| format!("BUILD_NUMBER must be an integer, got '{}'", s))
            })
            .transpose()?;

        config.build_url = lookup("BUILD_URL").filter(|s| !s.is_empty());

        if let Some(dir) = lookup("GANTRY_STATE_DIR").filter(|s| !s.is_empty()) {
            config.state_dir = PathBuf::from(dir);
        }

        if let Some(shell) = lookup("GANTRY_SHELL") {
            config.shell = shell;
        }

        if let Some(sendmail) = lookup("GANTRY_SENDMAIL") {
            config.sendmail = sendmail;
        }

        if let Some(from) = lookup("GANTRY_MAIL_FROM") {
            config.mail_from = from;
        }

        config.stage_timeout = lookup("GANTRY_STAGE_TIMEOUT")
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("GANTRY_STAGE_TIMEOUT must be seconds, got '{}'", s))
            })
            .transpose()?;

        Ok(config)
    }

    /// Points the configuration at another workspace, moving the default state dir along
    pub fn with_workspace(mut self, workspace: PathBuf) -> Self {
        if self.state_dir == self.workspace.join(".gantry") {
            self.state_dir = workspace.join(".gantry");
        }
        self.workspace = workspace;
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.workspace.as_os_str().is_empty() {
            bail!("workspace cannot be empty");
        }

        if self.shell.trim().is_empty() {
            bail!("shell cannot be empty");
        }

        if let Some(url) = &self.build_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("build_url must start with http:// or https://");
            }
        }

        if let Some(timeout) = self.stage_timeout {
            if timeout.is_zero() {
                bail!("stage_timeout must be greater than 0");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::new(PathBuf::from("/srv/ws"));
        assert_eq!(config.state_dir, PathBuf::from("/srv/ws/.gantry"));
        assert_eq!(config.shell, "sh");
        assert_eq!(config.sendmail, "sendmail");
        assert!(config.build_number.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup() {
        let config = RunnerConfig::from_lookup(lookup_from(&[
            ("WORKSPACE", "/srv/ws"),
            ("JOB_NAME", "webapp"),
            ("BUILD_NUMBER", "42"),
            ("BUILD_URL", "https://ci.example.com/job/webapp/42/"),
            ("GANTRY_STAGE_TIMEOUT", "600"),
        ]))
        .unwrap();

        assert_eq!(config.workspace, PathBuf::from("/srv/ws"));
        assert_eq!(config.job_name.as_deref(), Some("webapp"));
        assert_eq!(config.build_number, Some(42));
        assert_eq!(config.stage_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.state_dir, PathBuf::from("/srv/ws/.gantry"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_build_number() {
        let result = RunnerConfig::from_lookup(lookup_from(&[
            ("WORKSPACE", "/srv/ws"),
            ("BUILD_NUMBER", "abc"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = RunnerConfig::new(PathBuf::from("/srv/ws"));

        config.build_url = Some("ci.example.com".to_string());
        assert!(config.validate().is_err());

        config.build_url = Some("http://ci.example.com/".to_string());
        assert!(config.validate().is_ok());

        config.shell = " ".to_string();
        assert!(config.validate().is_err());

        config.shell = "bash".to_string();
        config.stage_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_workspace_moves_default_state_dir() {
        let config = RunnerConfig::new(PathBuf::from("/a")).with_workspace(PathBuf::from("/b"));
        assert_eq!(config.state_dir, PathBuf::from("/b/.gantry"));

        let mut custom = RunnerConfig::new(PathBuf::from("/a"));
        custom.state_dir = PathBuf::from("/var/lib/gantry");
        let custom = custom.with_workspace(PathBuf::from("/b"));
        assert_eq!(custom.state_dir, PathBuf::from("/var/lib/gantry"));
    }
}
