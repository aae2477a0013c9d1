use crate::val::Val;
use anyhow::{Result, anyhow, bail};
use std::collections::HashMap;

/// Registry of native modules and global builtins.
///
/// Native libraries register themselves here before an engine starts. Each
/// module contributes a namespace (the value `import "name"` resolves to) and
/// may also expose some of its functions as globals.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Box<dyn Module>>,
    namespaces: HashMap<String, Val>,
    builtin_functions: HashMap<String, Val>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module with the registry. Its exports become the namespace
    /// returned by `import`.
    pub fn register_module(&mut self, name: &str, module: Box<dyn Module>) -> Result<()> {
        if self.modules.contains_key(name) {
            bail!("module '{}' is already registered", name);
        }
        if module.enabled() {
            module.register(self)?;
            let exports = module.exports();
            self.namespaces
                .insert(name.to_string(), Val::map_from(exports.into_iter()));
        }
        self.modules.insert(name.to_string(), module);
        Ok(())
    }

    pub fn get_module(&self, name: &str) -> Result<&dyn Module> {
        self.modules
            .get(name)
            .map(|boxed| boxed.as_ref())
            .ok_or_else(|| anyhow!("Module '{}' not found", name))
    }

    /// Namespace map of a registered module.
    pub fn namespace(&self, name: &str) -> Option<&Val> {
        self.namespaces.get(name)
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.namespaces.contains_key(name)
    }

    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a builtin function globally
    pub fn register_builtin(&mut self, name: &str, func: Val) {
        self.builtin_functions.insert(name.to_string(), func);
    }

    pub fn get_builtin(&self, name: &str) -> Option<&Val> {
        self.builtin_functions.get(name)
    }

    /// Every global builtin, in no particular order.
    pub fn builtins(&self) -> impl Iterator<Item = (&String, &Val)> {
        self.builtin_functions.iter()
    }
}

/// A native library.
pub trait Module: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn enabled(&self) -> bool {
        true
    }

    /// Register globals (if any) with the registry.
    fn register(&self, registry: &mut ModuleRegistry) -> Result<()>;

    /// Functions and constants making up the module namespace.
    fn exports(&self) -> HashMap<String, Val>;
}
