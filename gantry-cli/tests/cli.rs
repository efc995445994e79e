//! CLI integration tests
//!
//! Drive the `gantry` binary against scratch workspaces with pipelines made
//! of plain shell commands.

#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

const CI_VARS: &[&str] = &[
    "WORKSPACE",
    "JOB_NAME",
    "BUILD_NUMBER",
    "BUILD_URL",
    "BRANCH_NAME",
    "GANTRY_STATE_DIR",
    "GANTRY_SHELL",
    "GANTRY_SENDMAIL",
    "GANTRY_MAIL_FROM",
    "GANTRY_STAGE_TIMEOUT",
];

fn gantry(cwd: &Path) -> Command {
    let mut cmd = Command::cargo_bin("gantry").unwrap();
    cmd.current_dir(cwd).env("NO_COLOR", "1").env("CLICOLOR", "0");
    for var in CI_VARS {
        cmd.env_remove(var);
    }
    cmd
}

fn write_pipeline(dir: &Path, source: &str) -> PathBuf {
    let path = dir.join("pipeline.lua");
    fs::write(&path, source).unwrap();
    path
}

fn demo_pipeline() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos/webapp/pipeline.lua")
}

const PASSING: &str = r#"
return pipeline.define {
  name = "hello",
  trigger = { branch = "main" },
  environment = { GREETING = "hello from ${JOB_NAME}" },
  stages = {
    { name = "Build", steps = { "mkdir -p out && echo built > out/app.jar" } },
    { name = "Archive", steps = { pipeline.archive { pattern = "out/*.jar", export = "APP" } } },
    { name = "Deploy", steps = { "echo \"$GREETING deploying ${APP}\"" } },
  },
}
"#;

const FAILING: &str = r#"
return pipeline.define {
  name = "broken",
  stages = {
    { name = "Build", steps = { "echo compiling", "exit 3" },
      post = { always = { pipeline.echo "cleaning up" } } },
    { name = "Deploy", steps = { "echo should-not-run" } },
  },
}
"#;

#[test]
fn test_help_lists_commands() {
    let dir = tempfile::tempdir().unwrap();
    gantry(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("runs"))
        .stdout(predicate::str::contains("init"));
}

#[test]
fn test_validate_demo_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    gantry(dir.path())
        .arg("validate")
        .arg(demo_pipeline())
        .assert()
        .success()
        .stdout(predicate::str::contains("Pipeline 'webapp' is valid"))
        .stdout(predicate::str::contains("Provision"))
        .stdout(predicate::str::contains(
            "ansible-playbook -i inventory.ini deploy.yml -e artifact_path=${ARTIFACT_FILE}",
        ));
}

#[test]
fn test_validate_json() {
    let dir = tempfile::tempdir().unwrap();
    gantry(dir.path())
        .args(["validate", "--json"])
        .arg(demo_pipeline())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"webapp\""))
        .stdout(predicate::str::contains("\"kind\": \"archive\""));
}

#[test]
fn test_validate_rejects_invalid_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_pipeline(dir.path(), "return pipeline.define { name = 'x', stages = {} }");
    gantry(dir.path())
        .arg("validate")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_run_success() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_pipeline(dir.path(), PASSING);

    let assert = gantry(dir.path())
        .arg("run")
        .arg(&file)
        .args(["--workspace", "."])
        .args(["--branch", "main"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Starting stage: Build"))
        .stdout(predicate::str::contains("hello from hello deploying"))
        .stdout(predicate::str::contains("out/app.jar"));

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    let last = stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap();
    assert_eq!(last.trim(), "Pipeline completed successfully");

    let record = fs::read_to_string(dir.path().join(".gantry/runs/1/run.json")).unwrap();
    assert!(record.contains("\"status\": \"Succeeded\""));
    assert!(dir.path().join(".gantry/runs/1/archive/out/app.jar").is_file());
    assert!(dir.path().join(".gantry/runs/1/console.log").is_file());
}

#[test]
fn test_run_failure_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_pipeline(dir.path(), FAILING);

    gantry(dir.path())
        .arg("run")
        .arg(&file)
        .args(["--workspace", ".", "--job-name", "broken-job", "--build-number", "7"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("compiling"))
        .stdout(predicate::str::contains("cleaning up"))
        .stdout(predicate::str::contains("exit code 3"))
        .stdout(predicate::str::contains("should-not-run").not());

    let log = fs::read_to_string(dir.path().join(".gantry/runs/7/console.log")).unwrap();
    assert!(log.contains("Stage 'Build' failed: command exited with code 3"));
}

#[test]
fn test_rerun_with_same_build_number_replaces_log() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_pipeline(dir.path(), PASSING);

    for _ in 0..2 {
        gantry(dir.path())
            .arg("run")
            .arg(&file)
            .args(["--workspace", ".", "--build-number", "1", "--quiet"])
            .assert()
            .success();
    }

    let log = fs::read_to_string(dir.path().join(".gantry/runs/1/console.log")).unwrap();
    assert_eq!(log.matches("Starting pipeline").count(), 1);
}

#[test]
fn test_run_skips_other_branches() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_pipeline(dir.path(), PASSING);

    gantry(dir.path())
        .arg("run")
        .arg(&file)
        .args(["--workspace", ".", "--branch", "develop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Skipped"));

    assert!(!dir.path().join("out").exists());
}

#[test]
fn test_run_params_reach_commands() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_pipeline(
        dir.path(),
        r#"
return pipeline.define {
  name = "params",
  stages = { { name = "Show", steps = { "echo target=${DEPLOY_ENV}" } } },
}
"#,
    );

    gantry(dir.path())
        .arg("run")
        .arg(&file)
        .args(["--workspace", ".", "--param", "DEPLOY_ENV=staging"])
        .assert()
        .success()
        .stdout(predicate::str::contains("target=staging"));
}

#[test]
fn test_runs_list_and_show() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_pipeline(dir.path(), FAILING);

    gantry(dir.path())
        .arg("run")
        .arg(&file)
        .args(["--workspace", ".", "--quiet"])
        .assert()
        .code(1);

    gantry(dir.path())
        .args(["runs", "--workspace", ".", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("#1 broken"))
        .stdout(predicate::str::contains("FAILURE"));

    gantry(dir.path())
        .args(["runs", "--workspace", ".", "show", "1", "--log"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[INFO] compiling"));

    gantry(dir.path())
        .args(["runs", "--workspace", ".", "show", "2"])
        .assert()
        .failure();
}

#[test]
fn test_init_pipeline_then_validate() {
    let dir = tempfile::tempdir().unwrap();

    gantry(dir.path())
        .args(["init", "pipeline"])
        .assert()
        .success();

    gantry(dir.path())
        .args(["validate", "pipeline.lua"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pipeline 'webapp' is valid"));

    gantry(dir.path())
        .args(["init", "pipeline"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_init_lua() {
    let dir = tempfile::tempdir().unwrap();

    gantry(dir.path())
        .args(["init", "lua", "--output", "dev"])
        .assert()
        .success();

    assert!(dir.path().join("dev/.luarc.json").is_file());
    assert!(dir.path().join("dev/.gantry/stubs/pipeline.lua").is_file());
    assert!(dir.path().join("dev/.gantry/stubs/env.lua").is_file());
}
