//! Environment module for reading run variables while a pipeline file is evaluated
//!
//! Lets a definition adapt to its run, e.g. choosing a variable file from
//! `env.get("DEPLOY_ENV", "staging")`.

use crate::module::{GantryModule, ModuleMetadata};
use mlua::prelude::*;
use std::sync::Arc;

/// Source of variables exposed through the `env` module
pub trait VarProvider: Send + Sync {
    /// Get a variable by name
    fn get(&self, name: &str) -> Option<String>;

    /// All variable names this provider can resolve
    fn keys(&self) -> Vec<String>;
}

/// Environment module, generic over where the variables come from
pub struct EnvModule<V: VarProvider> {
    provider: Arc<V>,
}

impl<V: VarProvider> EnvModule<V> {
    pub fn new(provider: V) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }
}

impl<V: VarProvider + 'static> GantryModule for EnvModule<V> {
    fn id(&self) -> &'static str {
        "env"
    }

    fn register(&self, lua: &Lua) -> LuaResult<()> {
        let env_table = lua.create_table()?;

        // env.get(name, default?)
        {
            let provider = self.provider.clone();
            env_table.set(
                "get",
                lua.create_function(move |_, (name, default): (String, Option<String>)| {
                    Ok(provider.get(&name).or(default))
                })?,
            )?;
        }

        // env.require(name) errors when the variable is missing
        {
            let provider = self.provider.clone();
            env_table.set(
                "require",
                lua.create_function(move |_, name: String| {
                    provider.get(&name).ok_or_else(|| {
                        LuaError::RuntimeError(format!(
                            "Required environment variable '{}' is not set",
                            name
                        ))
                    })
                })?,
            )?;
        }

        {
            let provider = self.provider.clone();
            env_table.set(
                "has",
                lua.create_function(move |_, name: String| Ok(provider.get(&name).is_some()))?,
            )?;
        }

        {
            let provider = self.provider.clone();
            env_table.set(
                "all",
                lua.create_function(move |lua, ()| {
                    let table = lua.create_table()?;
                    for key in provider.keys() {
                        if let Some(value) = provider.get(&key) {
                            table.set(key, value)?;
                        }
                    }
                    Ok(table)
                })?,
            )?;
        }

        {
            let provider = self.provider.clone();
            env_table.set(
                "keys",
                lua.create_function(move |lua, ()| {
                    let mut keys = provider.keys();
                    keys.sort();
                    lua.create_sequence_from(keys)
                })?,
            )?;
        }

        lua.globals().set(self.id(), env_table)?;
        Ok(())
    }

    fn stubs(&self) -> String {
        r#"---@meta

---Run variables (WORKSPACE, JOB_NAME, BUILD_NUMBER, BUILD_URL, parameters)
---@class env
env = {}

---Get a variable, or `default` when it is not set
---@param name string
---@param default? string
---@return string?
function env.get(name, default) end

---Get a variable, raising an error when it is not set
---@param name string
---@return string
function env.require(name) end

---Check whether a variable is set
---@param name string
---@return boolean
function env.has(name) end

---All variables as a table
---@return table<string, string>
function env.all() end

---All variable names, sorted
---@return string[]
function env.keys() end
"#
        .to_string()
    }

    fn metadata(&self) -> ModuleMetadata {
        ModuleMetadata {
            id: self.id(),
            version: env!("CARGO_PKG_VERSION"),
            description: "Run variable access for pipeline definitions",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TestVarProvider {
        vars: HashMap<String, String>,
    }

    impl VarProvider for TestVarProvider {
        fn get(&self, name: &str) -> Option<String> {
            self.vars.get(name).cloned()
        }

        fn keys(&self) -> Vec<String> {
            self.vars.keys().cloned().collect()
        }
    }

    fn lua_with(vars: &[(&str, &str)]) -> Lua {
        let provider = TestVarProvider {
            vars: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        let lua = Lua::new();
        EnvModule::new(provider).register(&lua).unwrap();
        lua
    }

    #[test]
    fn test_env_get() {
        let lua = lua_with(&[("BUILD_NUMBER", "17")]);

        let value: String = lua.load(r#"return env.get("BUILD_NUMBER")"#).eval().unwrap();
        assert_eq!(value, "17");

        let value: String = lua
            .load(r#"return env.get("DEPLOY_ENV", "staging")"#)
            .eval()
            .unwrap();
        assert_eq!(value, "staging");

        let missing: Option<String> = lua.load(r#"return env.get("NOPE")"#).eval().unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_env_require() {
        let lua = lua_with(&[("JOB_NAME", "webapp")]);

        let value: String = lua.load(r#"return env.require("JOB_NAME")"#).eval().unwrap();
        assert_eq!(value, "webapp");

        let result: LuaResult<String> = lua.load(r#"return env.require("MISSING")"#).eval();
        assert!(result.unwrap_err().to_string().contains("MISSING"));
    }

    #[test]
    fn test_env_has_and_keys() {
        let lua = lua_with(&[("B", "2"), ("A", "1")]);

        let has: bool = lua.load(r#"return env.has("A")"#).eval().unwrap();
        assert!(has);

        let joined: String = lua
            .load(r#"return table.concat(env.keys(), ",")"#)
            .eval()
            .unwrap();
        assert_eq!(joined, "A,B");

        let b: String = lua.load(r#"return env.all().B"#).eval().unwrap();
        assert_eq!(b, "2");
    }

    #[test]
    fn test_env_stubs() {
        let module = EnvModule::new(TestVarProvider {
            vars: HashMap::new(),
        });
        let stubs = module.stubs();
        assert!(stubs.starts_with("---@meta"));
        assert!(stubs.contains("function env.require(name) end"));
    }
}
