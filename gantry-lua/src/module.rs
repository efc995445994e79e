use anyhow::{Result, bail};
use mlua::prelude::*;

/// Trait for Gantry Lua modules.
///
/// Each module provides functionality to pipeline files evaluated in the
/// sandbox. Modules must have a unique identifier and register their
/// functions into the Lua global scope under that identifier.
///
/// # Example
///
/// ```rust
/// use gantry_lua::GantryModule;
/// use mlua::prelude::*;
///
/// struct VersionModule;
///
/// impl GantryModule for VersionModule {
///     fn id(&self) -> &'static str {
///         "version"
///     }
///
///     fn register(&self, lua: &Lua) -> LuaResult<()> {
///         let table = lua.create_table()?;
///         table.set("current", lua.create_function(|_, ()| Ok("1.0.0"))?)?;
///         lua.globals().set(self.id(), table)?;
///         Ok(())
///     }
///
///     fn stubs(&self) -> String {
///         "---@meta\n---@class version\nversion = {}\n".to_string()
///     }
/// }
/// ```
pub trait GantryModule: Send + Sync {
    /// Returns the unique identifier for this module.
    ///
    /// This identifier is the global variable name in Lua: if `id()`
    /// returns `"log"`, pipeline files call `log.info(...)`.
    fn id(&self) -> &'static str;

    /// Registers this module's functions and values into the Lua context.
    ///
    /// # Errors
    /// Returns `LuaError` if registration fails
    fn register(&self, lua: &Lua) -> LuaResult<()>;

    /// Generates Lua Language Server stubs for this module.
    ///
    /// The stub should start with `---@meta` to mark it as a definition file.
    fn stubs(&self) -> String;

    /// Returns module metadata (version, description)
    fn metadata(&self) -> ModuleMetadata {
        ModuleMetadata {
            id: self.id(),
            version: env!("CARGO_PKG_VERSION"),
            description: "",
        }
    }
}

/// Metadata about a Gantry module
#[derive(Debug, Clone)]
pub struct ModuleMetadata {
    pub id: &'static str,
    pub version: &'static str,
    pub description: &'static str,
}

/// Registry of modules loaded into the sandbox before a pipeline file is evaluated
pub struct ModuleRegistry {
    modules: Vec<Box<dyn GantryModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// Registers a module
    ///
    /// # Errors
    /// Fails if a module with the same id is already registered, or if the id
    /// collides with the built-in `pipeline` module
    pub fn register<M: GantryModule + 'static>(&mut self, module: M) -> Result<()> {
        let id = module.id();
        if id == "pipeline" {
            bail!("Module id 'pipeline' is reserved");
        }
        if self.modules.iter().any(|m| m.id() == id) {
            bail!("Module with id '{}' is already registered", id);
        }
        self.modules.push(Box::new(module));
        Ok(())
    }

    /// Gets a module by its ID
    pub fn get(&self, id: &str) -> Option<&dyn GantryModule> {
        self.modules
            .iter()
            .find(|m| m.id() == id)
            .map(|m| m.as_ref())
    }

    pub fn modules(&self) -> &[Box<dyn GantryModule>] {
        &self.modules
    }

    /// Registers all modules into a Lua context, stopping at the first error
    pub fn register_all(&self, lua: &Lua) -> LuaResult<()> {
        for module in &self.modules {
            module.register(lua)?;
        }
        Ok(())
    }

    /// Concatenated stubs for every registered module
    pub fn generate_stubs(&self) -> String {
        let mut stubs = String::new();
        for module in &self.modules {
            stubs.push_str(&module.stubs());
            stubs.push_str("\n\n");
        }
        stubs
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
