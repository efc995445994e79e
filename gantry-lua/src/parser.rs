//! Pipeline definition parser
//!
//! Evaluates a pipeline file in the sandbox and converts the returned table
//! into a [`PipelineDefinition`]. No command is executed here; the stages
//! are only described.

use anyhow::{Context, Result, anyhow, bail};
use gantry_core::domain::pipeline::{
    NotifyConfig, PipelineDefinition, PostActions, StageDefinition, Step, Trigger,
};
use mlua::{Table, Value};
use std::collections::{BTreeMap, HashSet};

use crate::module::ModuleRegistry;
use crate::sandbox::create_sandbox;

/// Parse a pipeline definition from Lua source code
///
/// The modules in `registry` are registered into the sandbox first, so the
/// file can call e.g. `env.get(...)` or `log.info(...)` while it builds its
/// definition.
///
/// # Errors
/// Returns an error if:
/// - The Lua source is invalid or does not return a table
/// - Required fields are missing (name, stages, stage name, steps)
/// - Field types are incorrect, or a step kind is unknown
/// - Stage names are duplicated
///
/// # Example
/// ```no_run
/// use gantry_lua::{ModuleRegistry, parse_pipeline_definition};
///
/// let source = r#"
///     return pipeline.define {
///         name = "webapp",
///         stages = {
///             { name = "Build", steps = { "mvn -B clean package" } },
///             { name = "Archive", steps = { pipeline.archive "webapp/target/*.jar" } },
///         },
///     }
/// "#;
///
/// let definition = parse_pipeline_definition(source, &ModuleRegistry::new())?;
/// assert_eq!(definition.stages.len(), 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn parse_pipeline_definition(
    source: &str,
    registry: &ModuleRegistry,
) -> Result<PipelineDefinition> {
    let lua = create_sandbox().context("Failed to create sandbox")?;
    registry
        .register_all(&lua)
        .context("Failed to register modules")?;

    let pipeline: Table = lua
        .load(source)
        .set_name("pipeline")
        .eval()
        .context("Failed to evaluate pipeline definition")?;

    let name: String = pipeline
        .get("name")
        .context("Pipeline must have a 'name' field")?;
    if name.trim().is_empty() {
        bail!("Pipeline name cannot be empty");
    }

    let description: Option<String> = pipeline
        .get("description")
        .context("Field 'description' must be a string")?;

    let trigger = parse_trigger(&pipeline)?;
    let environment = parse_string_map(&pipeline, "environment")?;
    let notify = parse_notify(&pipeline)?;
    let stages = parse_stages(&pipeline)?;

    Ok(PipelineDefinition {
        name,
        description,
        trigger,
        environment,
        notify,
        stages,
    })
}

fn parse_trigger(pipeline: &Table) -> Result<Trigger> {
    match pipeline.get::<Value>("trigger")? {
        Value::Nil => Ok(Trigger::default()),
        Value::Table(table) => {
            let branch: Option<String> = table
                .get("branch")
                .context("Field 'trigger.branch' must be a string")?;
            Ok(Trigger { branch })
        }
        _ => Err(anyhow!("Field 'trigger' must be a table")),
    }
}

fn parse_notify(pipeline: &Table) -> Result<NotifyConfig> {
    match pipeline.get::<Value>("notify")? {
        Value::Nil => Ok(NotifyConfig::default()),
        Value::Table(table) => {
            let email: Option<String> = table
                .get("email")
                .context("Field 'notify.email' must be a string")?;
            let webhook: Option<String> = table
                .get("webhook")
                .context("Field 'notify.webhook' must be a string")?;
            if let Some(url) = &webhook {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    bail!("Field 'notify.webhook' must start with http:// or https://");
                }
            }
            Ok(NotifyConfig { email, webhook })
        }
        _ => Err(anyhow!("Field 'notify' must be a table")),
    }
}

/// Parse a table of string values, stringifying numbers and booleans
fn parse_string_map(table: &Table, field: &str) -> Result<BTreeMap<String, String>> {
    match table.get::<Value>(field)? {
        Value::Nil => Ok(BTreeMap::new()),
        Value::Table(entries) => {
            let mut map = BTreeMap::new();
            for pair in entries.pairs::<String, Value>() {
                let (key, value) =
                    pair.with_context(|| format!("Field '{}' must have string keys", field))?;
                let value = scalar_to_string(&value).ok_or_else(|| {
                    anyhow!(
                        "Value of '{}.{}' must be a string, number or boolean",
                        field,
                        key
                    )
                })?;
                map.insert(key, value);
            }
            Ok(map)
        }
        _ => Err(anyhow!("Field '{}' must be a table", field)),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_string_lossy()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_stages(pipeline: &Table) -> Result<Vec<StageDefinition>> {
    let stages_table: Table = pipeline
        .get("stages")
        .context("Pipeline must have a 'stages' field")?;

    let mut stages = Vec::new();
    let mut seen = HashSet::new();

    for (idx, entry) in stages_table.sequence_values::<Table>().enumerate() {
        let stage_table =
            entry.with_context(|| format!("Stage #{} must be a table", idx + 1))?;
        let stage = parse_stage(&stage_table)
            .with_context(|| format!("Invalid stage #{}", idx + 1))?;

        if !seen.insert(stage.name.clone()) {
            bail!("Duplicate stage name '{}'", stage.name);
        }
        stages.push(stage);
    }

    if stages.is_empty() {
        bail!("Pipeline must have at least one stage");
    }

    Ok(stages)
}

fn parse_stage(stage_table: &Table) -> Result<StageDefinition> {
    let name: String = stage_table
        .get("name")
        .context("Stage must have a 'name' field")?;
    if name.trim().is_empty() {
        bail!("Stage name cannot be empty");
    }

    let dir: Option<String> = stage_table
        .get("dir")
        .with_context(|| format!("Stage '{}': 'dir' must be a string", name))?;

    let env = parse_string_map(stage_table, "env").with_context(|| format!("Stage '{}'", name))?;

    let timeout_seconds = match stage_table
        .get::<Option<i64>>("timeout")
        .with_context(|| format!("Stage '{}': 'timeout' must be an integer", name))?
    {
        None => None,
        Some(secs) if secs > 0 => Some(secs as u64),
        Some(_) => bail!("Stage '{}': 'timeout' must be greater than 0", name),
    };

    let steps_table: Table = stage_table
        .get("steps")
        .with_context(|| format!("Stage '{}' must have a 'steps' list", name))?;
    let steps = parse_step_list(&steps_table).with_context(|| format!("Stage '{}'", name))?;
    if steps.is_empty() {
        bail!("Stage '{}' must have at least one step", name);
    }

    let post = match stage_table.get::<Value>("post")? {
        Value::Nil => PostActions::default(),
        Value::Table(post_table) => {
            let always = match post_table.get::<Value>("always")? {
                Value::Nil => Vec::new(),
                Value::Table(list) => parse_step_list(&list)
                    .with_context(|| format!("Stage '{}' post.always", name))?,
                _ => bail!("Stage '{}': 'post.always' must be a list of steps", name),
            };
            PostActions { always }
        }
        _ => bail!("Stage '{}': 'post' must be a table", name),
    };

    Ok(StageDefinition {
        name,
        dir,
        env,
        steps,
        post,
        timeout_seconds,
    })
}

fn parse_step_list(list: &Table) -> Result<Vec<Step>> {
    let mut steps = Vec::new();
    for (idx, entry) in list.sequence_values::<Value>().enumerate() {
        let value = entry.with_context(|| format!("Failed to read step #{}", idx + 1))?;
        let step = match value {
            Value::String(command) => Step::Sh {
                command: command.to_string_lossy(),
            },
            Value::Table(table) => {
                parse_step(&table).with_context(|| format!("Invalid step #{}", idx + 1))?
            }
            other => bail!(
                "Step #{} must be a string or a step table, got {}",
                idx + 1,
                other.type_name()
            ),
        };
        steps.push(step);
    }
    Ok(steps)
}

fn parse_step(table: &Table) -> Result<Step> {
    let kind: String = table
        .get("kind")
        .context("Step table must have a 'kind' field (use the pipeline.* helpers)")?;

    let step = match kind.as_str() {
        "sh" => Step::Sh {
            command: required_string(table, "command")?,
        },
        "echo" => Step::Echo {
            message: required_string(table, "message")?,
        },
        "checkout" => Step::Checkout {
            url: required_string(table, "url")?,
            branch: table
                .get::<Option<String>>("branch")?
                .unwrap_or_else(|| "main".to_string()),
        },
        "archive" => {
            let export: Option<String> = table.get("export")?;
            if let Some(name) = &export {
                if !is_valid_identifier(name) {
                    bail!("Archive export '{}' is not a valid variable name", name);
                }
            }
            Step::Archive {
                pattern: required_string(table, "pattern")?,
                fingerprint: table.get::<Option<bool>>("fingerprint")?.unwrap_or(true),
                export,
            }
        }
        "publish" => Step::Publish {
            pattern: required_string(table, "pattern")?,
            allow_empty: table.get::<Option<bool>>("allow_empty")?.unwrap_or(false),
        },
        other => bail!("Unknown step kind '{}'", other),
    };

    Ok(step)
}

fn required_string(table: &Table, field: &str) -> Result<String> {
    let value: Option<String> = table
        .get(field)
        .with_context(|| format!("Field '{}' must be a string", field))?;
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(anyhow!("Step must have a non-empty '{}' field", field)),
    }
}

/// Shell-style variable name: letter or underscore, then alphanumerics
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
