//! Console log buffer
//!
//! Collects the console log of a run in memory. Entries are drained into
//! the run store when the run finishes; with echo enabled they are also
//! printed as they arrive.

use gantry_core::domain::log::{LogEntry, LogLevel};
use std::sync::{Arc, Mutex, PoisonError};

/// Service for collecting console log entries
pub trait LogBufferService: Send + Sync {
    /// Adds a log entry to the buffer
    fn add_entry(&self, entry: LogEntry);

    /// Returns and clears all buffered entries
    fn drain(&self) -> Vec<LogEntry>;

    fn info(&self, message: String) {
        self.add_entry(LogEntry::now(LogLevel::Info, message));
    }

    fn error(&self, message: String) {
        self.add_entry(LogEntry::now(LogLevel::Error, message));
    }
}

/// In-memory implementation of LogBufferService
///
/// Cloning shares the underlying buffer.
#[derive(Clone, Default)]
pub struct InMemoryLogBuffer {
    buffer: Arc<Mutex<Vec<LogEntry>>>,
    echo: bool,
}

impl InMemoryLogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prints each entry's message to stdout as it is added
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Copy of the current entries without draining
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LogBufferService for InMemoryLogBuffer {
    fn add_entry(&self, entry: LogEntry) {
        if self.echo {
            match entry.level {
                LogLevel::Debug => {}
                LogLevel::Info => println!("{}", entry.message),
                LogLevel::Warning | LogLevel::Error => eprintln!("{}", entry.message),
            }
        }
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    fn drain(&self) -> Vec<LogEntry> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}
