//! JUnit test report collection

use anyhow::{Context, Result};
use gantry_core::domain::artifact::{ReportRecord, TestSummary};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::fs;
use std::path::{Path, PathBuf};

/// Sums the counters of every `<testsuite>` element in a JUnit XML document
///
/// `<testsuites>` wrappers are ignored; their counters duplicate the suites'.
/// Text and CDATA (captured test output) never count. Missing or non-numeric
/// attributes count as zero; malformed XML is an error.
pub fn parse_junit(xml: &str) -> Result<TestSummary> {
    let mut reader = Reader::from_str(xml);
    let mut total = TestSummary::default();

    loop {
        match reader.read_event().context("Malformed XML")? {
            Event::Start(ref e) | Event::Empty(ref e)
                if e.local_name().as_ref() == b"testsuite" =>
            {
                total = total + suite_counters(e)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(total)
}

fn suite_counters(element: &BytesStart<'_>) -> Result<TestSummary> {
    let mut summary = TestSummary::default();
    for attr in element.attributes() {
        let attr = attr.context("Malformed testsuite attribute")?;
        let value = String::from_utf8_lossy(&attr.value)
            .trim()
            .parse::<u64>()
            .unwrap_or(0);
        match attr.key.local_name().as_ref() {
            b"tests" => summary.tests = value,
            b"failures" => summary.failures = value,
            b"errors" => summary.errors = value,
            b"skipped" => summary.skipped = value,
            _ => {}
        }
    }
    Ok(summary)
}

/// Reads each workspace-relative report file into a [`ReportRecord`]
pub fn collect_reports(workspace: &Path, files: &[PathBuf]) -> Result<Vec<ReportRecord>> {
    files
        .iter()
        .map(|relative| {
            let path = workspace.join(relative);
            let xml = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read test report {}", path.display()))?;
            let summary = parse_junit(&xml)
                .with_context(|| format!("Invalid test report {}", path.display()))?;
            Ok(ReportRecord {
                path: relative.to_string_lossy().replace('\\', "/"),
                summary,
            })
        })
        .collect()
}
