//! Archived artifact and published report records

use serde::{Deserialize, Serialize};

/// A file persisted by an archive step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Path relative to the workspace root
    pub path: String,
    pub size: u64,
    /// SHA-256 of the file contents, lowercase hex
    pub fingerprint: Option<String>,
}

/// A test report file picked up by a publish step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub path: String,
    pub summary: TestSummary,
}

/// Counters read from a JUnit `<testsuite>` element
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub tests: u64,
    pub failures: u64,
    pub errors: u64,
    pub skipped: u64,
}

impl TestSummary {
    pub fn passed(&self) -> u64 {
        self.tests
            .saturating_sub(self.failures + self.errors + self.skipped)
    }

    pub fn has_failures(&self) -> bool {
        self.failures > 0 || self.errors > 0
    }
}

impl std::ops::Add for TestSummary {
    type Output = TestSummary;

    fn add(self, other: TestSummary) -> TestSummary {
        TestSummary {
            tests: self.tests + other.tests,
            failures: self.failures + other.failures,
            errors: self.errors + other.errors,
            skipped: self.skipped + other.skipped,
        }
    }
}

impl std::iter::Sum for TestSummary {
    fn sum<I: Iterator<Item = TestSummary>>(iter: I) -> Self {
        iter.fold(TestSummary::default(), |acc, s| acc + s)
    }
}
