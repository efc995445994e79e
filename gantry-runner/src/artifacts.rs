//! Artifact resolution, fingerprinting and archiving
//!
//! Patterns are workspace-relative globs: `*`, `?` and `[...]` stay within
//! one path segment, `**` spans directories.

use anyhow::{Context, Result, bail};
use gantry_core::domain::artifact::ArtifactRecord;
use glob::{MatchOptions, Pattern};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiles a glob matched against `/`-separated relative paths
pub fn compile_pattern(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern).with_context(|| format!("Invalid pattern '{}'", pattern))
}

/// Finds workspace files matching `pattern`
///
/// Returns workspace-relative paths, sorted. Anything under `exclude` (the
/// runner's own state directory) is never matched.
pub fn resolve_pattern(root: &Path, pattern: &str, exclude: &Path) -> Result<Vec<PathBuf>> {
    let pattern = relative_pattern(root, pattern)?;
    let matcher = compile_pattern(&pattern)?;

    let base = root.join(literal_prefix(&pattern));
    if !base.exists() {
        debug!("Pattern base {} does not exist", base.display());
        return Ok(Vec::new());
    }

    let mut matches = Vec::new();
    let walker = WalkDir::new(&base)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !entry.path().starts_with(exclude));

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to scan {}", base.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if matcher.matches_with(&to_slash(relative), MATCH_OPTIONS) {
            matches.push(relative.to_path_buf());
        }
    }

    matches.sort();
    Ok(matches)
}

/// Accepts absolute patterns that point inside the workspace
fn relative_pattern(root: &Path, pattern: &str) -> Result<String> {
    let path = Path::new(pattern);
    if !path.is_absolute() {
        return Ok(pattern.trim_start_matches("./").to_string());
    }
    match path.strip_prefix(root) {
        Ok(relative) => Ok(to_slash(relative)),
        Err(_) => bail!("Pattern '{}' is outside the workspace", pattern),
    }
}

/// Leading directories of a pattern that contain no wildcard
fn literal_prefix(pattern: &str) -> PathBuf {
    let segments: Vec<&str> = pattern.split('/').collect();
    let mut prefix = PathBuf::new();
    // The last segment names files, never a directory to descend into.
    for segment in &segments[..segments.len().saturating_sub(1)] {
        if segment.contains(['*', '?', '[']) {
            break;
        }
        prefix.push(segment);
    }
    prefix
}

fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// SHA-256 of a file's contents, lowercase hex
pub fn fingerprint(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Copies workspace-relative `files` into `archive_dir`, keeping their layout
pub fn archive_files(
    workspace: &Path,
    files: &[PathBuf],
    archive_dir: &Path,
    compute_fingerprint: bool,
) -> Result<Vec<ArtifactRecord>> {
    let mut records = Vec::with_capacity(files.len());

    for relative in files {
        let source = workspace.join(relative);
        let target = archive_dir.join(relative);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let size = fs::copy(&source, &target).with_context(|| {
            format!(
                "Failed to archive {} to {}",
                source.display(),
                target.display()
            )
        })?;

        let fingerprint = if compute_fingerprint {
            Some(fingerprint(&source)?)
        } else {
            None
        };

        records.push(ArtifactRecord {
            path: to_slash(relative),
            size,
            fingerprint,
        });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn matches(pattern: &str, path: &str) -> bool {
        compile_pattern(pattern)
            .unwrap()
            .matches_with(path, MATCH_OPTIONS)
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches("webapp/target/*.jar", "webapp/target/app-1.0.jar"));
        assert!(!matches("webapp/target/*.jar", "webapp/target/lib/dep.jar"));
        assert!(!matches("webapp/target/*.jar", "webapp/target/app.jar.sha1"));

        assert!(matches("**/surefire-reports/TEST-?.xml", "surefire-reports/TEST-a.xml"));
        assert!(matches(
            "**/surefire-reports/TEST-?.xml",
            "webapp/target/surefire-reports/TEST-b.xml"
        ));
        assert!(!matches(
            "**/surefire-reports/TEST-?.xml",
            "webapp/target/surefire-reports/TEST-ab.xml"
        ));
    }

    #[test]
    fn test_pattern_character_classes() {
        assert!(matches("webapp/target/app-[0-9]*.jar", "webapp/target/app-1.0.jar"));
        assert!(!matches("webapp/target/app-[0-9]*.jar", "webapp/target/app-sources.jar"));
        assert!(matches("out/[!.]*.txt", "out/a.txt"));
        assert!(compile_pattern("out/[a-").is_err());
    }

    #[test]
    fn test_resolve_pattern_with_character_class() {
        let ws = tempfile::tempdir().unwrap();
        touch(ws.path(), "webapp/target/app-1.0.jar", "jar");
        touch(ws.path(), "webapp/target/app-sources.jar", "src");

        let matches = resolve_pattern(
            ws.path(),
            "webapp/target/app-[0-9]*.jar",
            &ws.path().join(".gantry"),
        )
        .unwrap();

        assert_eq!(matches, vec![PathBuf::from("webapp/target/app-1.0.jar")]);
    }

    #[test]
    fn test_resolve_pattern_matches_single_jar() {
        let ws = tempfile::tempdir().unwrap();
        touch(ws.path(), "webapp/target/app-1.0.jar", "jar");
        touch(ws.path(), "webapp/target/classes/App.class", "class");
        touch(ws.path(), "webapp/pom.xml", "pom");

        let state = ws.path().join(".gantry");
        let matches = resolve_pattern(ws.path(), "webapp/target/*.jar", &state).unwrap();

        assert_eq!(matches, vec![PathBuf::from("webapp/target/app-1.0.jar")]);
    }

    #[test]
    fn test_resolve_pattern_excludes_state_dir() {
        let ws = tempfile::tempdir().unwrap();
        touch(ws.path(), "app.jar", "jar");
        touch(ws.path(), ".gantry/runs/1/archive/app.jar", "old");

        let state = ws.path().join(".gantry");
        let matches = resolve_pattern(ws.path(), "**/*.jar", &state).unwrap();

        assert_eq!(matches, vec![PathBuf::from("app.jar")]);
    }

    #[test]
    fn test_resolve_pattern_absolute_inside_workspace() {
        let ws = tempfile::tempdir().unwrap();
        touch(ws.path(), "out/a.txt", "a");

        let pattern = format!("{}/out/*.txt", ws.path().display());
        let matches = resolve_pattern(ws.path(), &pattern, &ws.path().join(".gantry")).unwrap();
        assert_eq!(matches, vec![PathBuf::from("out/a.txt")]);

        assert!(resolve_pattern(ws.path(), "/elsewhere/*.txt", &ws.path().join(".gantry")).is_err());
    }

    #[test]
    fn test_resolve_pattern_missing_base() {
        let ws = tempfile::tempdir().unwrap();
        let matches =
            resolve_pattern(ws.path(), "webapp/target/*.jar", &ws.path().join(".gantry")).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_fingerprint_is_sha256() {
        let ws = tempfile::tempdir().unwrap();
        touch(ws.path(), "hello.txt", "hello");

        let digest = fingerprint(&ws.path().join("hello.txt")).unwrap();
        assert_eq!(
            digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_archive_files_copies_and_records() {
        let ws = tempfile::tempdir().unwrap();
        touch(ws.path(), "webapp/target/app-1.0.jar", "hello");
        let archive_dir = ws.path().join(".gantry/runs/7/archive");

        let records = archive_files(
            ws.path(),
            &[PathBuf::from("webapp/target/app-1.0.jar")],
            &archive_dir,
            true,
        )
        .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "webapp/target/app-1.0.jar");
        assert_eq!(records[0].size, 5);
        assert_eq!(
            records[0].fingerprint.as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
        assert!(archive_dir.join("webapp/target/app-1.0.jar").is_file());
    }
}
