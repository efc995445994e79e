//! Lua sandbox creation
//!
//! Pipeline files are evaluated in a restricted Lua state without I/O, OS,
//! package loading or debug facilities. Only the definition is evaluated in
//! Lua; the commands it declares are executed later by the runner.
//!
//! The `pipeline` helper module is always injected. Other modules (`env`,
//! `log`) are registered by the caller through a `ModuleRegistry`.

use mlua::{Lua, LuaOptions, Result as LuaResult, StdLib, Table, Value};

/// Create a restricted Lua sandbox
///
/// Only the `table`, `string`, `math` and `coroutine` standard libraries are
/// loaded, and `require`, `dofile` and `loadfile` are removed.
///
/// # Example
/// ```no_run
/// use gantry_lua::sandbox::create_sandbox;
///
/// let lua = create_sandbox()?;
/// let definition: mlua::Table = lua
///     .load(r#"return pipeline.define { name = "webapp", stages = {} }"#)
///     .eval()?;
/// let name: String = definition.get("name")?;
/// assert_eq!(name, "webapp");
/// # Ok::<(), mlua::Error>(())
/// ```
pub fn create_sandbox() -> LuaResult<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::COROUTINE,
        LuaOptions::default(),
    )?;

    lua.globals().set("require", mlua::Nil)?;
    lua.globals().set("dofile", mlua::Nil)?;
    lua.globals().set("loadfile", mlua::Nil)?;

    register_pipeline_module(&lua)?;

    Ok(lua)
}

/// Register the `pipeline` helper module
///
/// `define` and `stage` return their argument unchanged; the step helpers
/// build `{ kind = ..., ... }` tables understood by the parser.
fn register_pipeline_module(lua: &Lua) -> LuaResult<()> {
    let pipeline = lua.create_table()?;

    pipeline.set(
        "define",
        lua.create_function(|_, definition: Table| Ok(definition))?,
    )?;
    pipeline.set("stage", lua.create_function(|_, stage: Table| Ok(stage))?)?;

    pipeline.set(
        "sh",
        lua.create_function(|lua, command: String| {
            let step = lua.create_table()?;
            step.set("kind", "sh")?;
            step.set("command", command)?;
            Ok(step)
        })?,
    )?;

    pipeline.set(
        "echo",
        lua.create_function(|lua, message: String| {
            let step = lua.create_table()?;
            step.set("kind", "echo")?;
            step.set("message", message)?;
            Ok(step)
        })?,
    )?;

    pipeline.set(
        "checkout",
        lua.create_function(|lua, options: Value| step_from(lua, "checkout", "url", options))?,
    )?;

    pipeline.set(
        "archive",
        lua.create_function(|lua, options: Value| {
            step_from(lua, "archive", "pattern", options)
        })?,
    )?;

    pipeline.set(
        "publish",
        lua.create_function(|lua, options: Value| {
            step_from(lua, "publish", "pattern", options)
        })?,
    )?;

    lua.globals().set("pipeline", pipeline)?;

    Ok(())
}

/// Builds a step table from either an options table or a single string
///
/// A string argument is stored under `primary`, so `pipeline.archive "*.jar"`
/// is the same as `pipeline.archive { pattern = "*.jar" }`.
fn step_from(lua: &Lua, kind: &str, primary: &str, options: Value) -> LuaResult<Table> {
    match options {
        Value::Table(table) => {
            table.set("kind", kind)?;
            Ok(table)
        }
        Value::String(s) => {
            let step = lua.create_table()?;
            step.set("kind", kind)?;
            step.set(primary, s)?;
            Ok(step)
        }
        other => Err(mlua::Error::RuntimeError(format!(
            "pipeline.{} expects a table or a string, got {}",
            kind,
            other.type_name()
        ))),
    }
}

/// LuaLS stubs for the built-in `pipeline` module
pub fn pipeline_stubs() -> String {
    r#"---@meta

---Pipeline definition helpers
---@class pipeline
pipeline = {}

---@class Step
---@field kind string

---@class Stage
---@field name string Stage name, unique within the pipeline
---@field dir? string Working directory relative to the workspace
---@field env? table<string, string> Environment overlay for this stage
---@field timeout? integer Timeout in seconds
---@field steps (Step|string)[] Steps; a bare string is a shell command
---@field post? { always: (Step|string)[] } Post-actions

---@class PipelineDefinition
---@field name string
---@field description? string
---@field trigger? { branch: string }
---@field environment? table<string, string>
---@field notify? { email?: string, webhook?: string }
---@field stages Stage[]

---Declare a pipeline
---@param definition PipelineDefinition
---@return PipelineDefinition
function pipeline.define(definition) end

---Declare a stage
---@param stage Stage
---@return Stage
function pipeline.stage(stage) end

---Run a shell command
---@param command string
---@return Step
function pipeline.sh(command) end

---Write a message to the console log
---@param message string
---@return Step
function pipeline.echo(message) end

---Fetch sources with git
---@param options { url: string, branch?: string }
---@return Step
function pipeline.checkout(options) end

---Archive and fingerprint files
---@param options string|{ pattern: string, fingerprint?: boolean, export?: string }
---@return Step
function pipeline.archive(options) end

---Publish JUnit test reports
---@param options string|{ pattern: string, allow_empty?: boolean }
---@return Step
function pipeline.publish(options) end
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_basic_lua() {
        let lua = create_sandbox().unwrap();

        let result: i32 = lua
            .load(
                r#"
                local t = {a = 1, b = 2}
                return t.a + t.b
            "#,
            )
            .eval()
            .unwrap();
        assert_eq!(result, 3);

        let result: String = lua
            .load(r#"return string.format("%s-%d", "build", 7)"#)
            .eval()
            .unwrap();
        assert_eq!(result, "build-7");
    }

    #[test]
    fn test_sandbox_no_io() {
        let lua = create_sandbox().unwrap();

        let has_io: bool = lua.load(r#"return io ~= nil"#).eval().unwrap();
        assert!(!has_io);

        let has_os: bool = lua.load(r#"return os ~= nil"#).eval().unwrap();
        assert!(!has_os);
    }

    #[test]
    fn test_sandbox_no_require() {
        let lua = create_sandbox().unwrap();

        let result: LuaResult<()> = lua.load(r#"require("os")"#).exec();
        assert!(result.is_err());

        let result: LuaResult<()> = lua.load(r#"dofile("/etc/passwd")"#).exec();
        assert!(result.is_err());
    }

    #[test]
    fn test_sandbox_no_core_modules_by_default() {
        let lua = create_sandbox().unwrap();

        let has_log: bool = lua.load(r#"return log ~= nil"#).eval().unwrap();
        assert!(!has_log);

        let has_env: bool = lua.load(r#"return env ~= nil"#).eval().unwrap();
        assert!(!has_env);
    }

    #[test]
    fn test_step_helpers() {
        let lua = create_sandbox().unwrap();

        let kind: String = lua
            .load(r#"return pipeline.sh("mvn -B package").kind"#)
            .eval()
            .unwrap();
        assert_eq!(kind, "sh");

        let pattern: String = lua
            .load(r#"return pipeline.archive("webapp/target/*.jar").pattern"#)
            .eval()
            .unwrap();
        assert_eq!(pattern, "webapp/target/*.jar");

        let export: String = lua
            .load(
                r#"
                local step = pipeline.archive { pattern = "*.jar", export = "ARTIFACT_FILE" }
                return step.kind .. ":" .. step.export
            "#,
            )
            .eval()
            .unwrap();
        assert_eq!(export, "archive:ARTIFACT_FILE");
    }

    #[test]
    fn test_step_helper_rejects_numbers() {
        let lua = create_sandbox().unwrap();
        let result: LuaResult<Table> = lua.load(r#"return pipeline.publish(42)"#).eval();
        let err = result.unwrap_err().to_string();
        assert!(err.contains("pipeline.publish expects a table or a string"));
    }

    #[test]
    fn test_define_returns_definition() {
        let lua = create_sandbox().unwrap();
        let name: String = lua
            .load(r#"return pipeline.define({ name = "webapp" }).name"#)
            .eval()
            .unwrap();
        assert_eq!(name, "webapp");
    }
}
