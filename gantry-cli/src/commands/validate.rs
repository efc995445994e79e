//! Validate command handler

use anyhow::Result;
use colored::*;
use gantry_core::domain::pipeline::{PipelineDefinition, Step};
use gantry_runner::{InMemoryLogBuffer, load_pipeline};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

/// Parse a pipeline file and print what it would run
pub fn handle_validate_command(file: &Path, json: bool) -> Result<ExitCode> {
    let definition = load_pipeline(file, BTreeMap::new(), Arc::new(InMemoryLogBuffer::new()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&definition)?);
    } else {
        print_definition(&definition);
    }

    Ok(ExitCode::SUCCESS)
}

fn print_definition(definition: &PipelineDefinition) {
    println!(
        "{}",
        format!("✓ Pipeline '{}' is valid", definition.name)
            .green()
            .bold()
    );
    if let Some(description) = &definition.description {
        println!("  {}", description.dimmed());
    }
    if let Some(branch) = &definition.trigger.branch {
        println!("  Trigger: push to {}", branch.cyan());
    }
    if let Some(email) = &definition.notify.email {
        println!("  Notify:  {}", email.cyan());
    }
    if let Some(webhook) = &definition.notify.webhook {
        println!("  Notify:  {}", webhook.cyan());
    }
    if !definition.environment.is_empty() {
        println!("  Environment:");
        for (key, value) in &definition.environment {
            println!("    {}={}", key.cyan(), value);
        }
    }

    println!("  Stages:");
    for (idx, stage) in definition.stages.iter().enumerate() {
        let mut extra = Vec::new();
        if let Some(dir) = &stage.dir {
            extra.push(format!("dir {}", dir));
        }
        if let Some(timeout) = stage.timeout_seconds {
            extra.push(format!("timeout {}s", timeout));
        }
        let extra = if extra.is_empty() {
            String::new()
        } else {
            format!(" ({})", extra.join(", "))
        };
        println!("    {}. {}{}", idx + 1, stage.name.bold(), extra.dimmed());

        for step in &stage.steps {
            print_step(step, "");
        }
        for step in &stage.post.always {
            print_step(step, "always: ");
        }
    }
}

fn print_step(step: &Step, prefix: &str) {
    println!(
        "       {} {}{}",
        format!("[{}]", step.kind()).dimmed(),
        prefix,
        step.describe()
    );
}
