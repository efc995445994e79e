//! Run store
//!
//! Every run gets a directory `<state>/runs/<build number>/` holding
//! `run.json` (the [`RunRecord`]), `console.log` and the `archive/` tree.

use anyhow::{Context, Result};
use gantry_core::domain::log::LogEntry;
use gantry_core::domain::run::RunRecord;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const RECORD_FILE: &str = "run.json";
const CONSOLE_FILE: &str = "console.log";

/// File-backed store of past runs
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    /// Opens the store under `state_dir`; nothing is created until a run is saved
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: state_dir.into(),
        }
    }

    /// The state directory; artifact patterns never match inside it
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_dir(&self, build_number: u64) -> PathBuf {
        self.runs_dir().join(build_number.to_string())
    }

    pub fn archive_dir(&self, build_number: u64) -> PathBuf {
        self.run_dir(build_number).join("archive")
    }

    pub fn console_log_path(&self, build_number: u64) -> PathBuf {
        self.run_dir(build_number).join(CONSOLE_FILE)
    }

    /// Build numbers with a run directory, ascending
    fn build_numbers(&self) -> Result<Vec<u64>> {
        let dir = self.runs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut numbers = Vec::new();
        for entry in
            fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// One past the highest recorded build number
    pub fn next_build_number(&self) -> Result<u64> {
        Ok(self.build_numbers()?.last().map_or(1, |n| n + 1))
    }

    /// Clears the console log and archive left by an earlier run with the same number
    pub fn reset(&self, build_number: u64) -> Result<()> {
        let console = self.console_log_path(build_number);
        if console.exists() {
            fs::remove_file(&console)
                .with_context(|| format!("Failed to remove {}", console.display()))?;
        }

        let archive = self.archive_dir(build_number);
        if archive.exists() {
            fs::remove_dir_all(&archive)
                .with_context(|| format!("Failed to remove {}", archive.display()))?;
        }

        debug!("Reset run directory for build {}", build_number);
        Ok(())
    }

    /// Writes `run.json`, replacing any earlier version of the record
    pub fn save(&self, run: &RunRecord) -> Result<()> {
        let dir = self.run_dir(run.build_number);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let json = serde_json::to_string_pretty(run).context("Failed to serialize run record")?;
        let tmp = dir.join(format!("{}.tmp", RECORD_FILE));
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, dir.join(RECORD_FILE))
            .with_context(|| format!("Failed to store run record in {}", dir.display()))?;

        debug!("Saved run record for build {}", run.build_number);
        Ok(())
    }

    /// Appends console log entries, one line each
    pub fn write_console_log(&self, build_number: u64, entries: &[LogEntry]) -> Result<PathBuf> {
        use std::io::Write;

        let path = self.console_log_path(build_number);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        for entry in entries {
            writeln!(file, "{}", entry.to_line())
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        Ok(path)
    }

    pub fn read_console_log(&self, build_number: u64) -> Result<String> {
        let path = self.console_log_path(build_number);
        fs::read_to_string(&path).with_context(|| format!("No console log for build {}", build_number))
    }

    pub fn load(&self, build_number: u64) -> Result<RunRecord> {
        let path = self.run_dir(build_number).join(RECORD_FILE);
        read_record(&path).with_context(|| format!("No run record for build {}", build_number))
    }

    /// All readable run records, ordered by build number
    ///
    /// Directories with a missing or corrupt `run.json` are skipped.
    pub fn list(&self) -> Result<Vec<RunRecord>> {
        let mut runs = Vec::new();
        for number in self.build_numbers()? {
            let path = self.run_dir(number).join(RECORD_FILE);
            match read_record(&path) {
                Ok(run) => runs.push(run),
                Err(e) => warn!("Skipping build {}: {:#}", number, e),
            }
        }
        Ok(runs)
    }
}

fn read_record(path: &Path) -> Result<RunRecord> {
    let json =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Failed to parse {}", path.display()))
}
