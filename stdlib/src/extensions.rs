//! Process-wide table of extension functions.
//!
//! Hosts register plain Rust closures here; `install_extensions` copies them
//! into a module registry as globals, and the `ext` module lets scripts look
//! them up by name at run time.

use anyhow::{Result, anyhow};
use dashmap::DashMap;
use lattice_core::module::{Module, ModuleRegistry};
use lattice_core::rt::Host;
use lattice_core::val::{Closure, ExtensionFn, NativeFn, Val};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

static EXTENSIONS: Lazy<DashMap<String, ExtensionFn>> = Lazy::new(DashMap::new);

/// Register (or replace) an extension function.
pub fn register_extension<F>(name: &str, func: F)
where
    F: Fn(&[Val]) -> Result<Val> + Send + Sync + 'static,
{
    debug!(target: "lattice::rt::module", name, "extension.register");
    EXTENSIONS.insert(name.to_string(), Arc::new(func));
}

pub fn unregister_extension(name: &str) -> bool {
    EXTENSIONS.remove(name).is_some()
}

pub fn extension(name: &str) -> Option<Val> {
    EXTENSIONS
        .get(name)
        .map(|entry| Val::closure(Closure::extension(name, entry.value().clone())))
}

/// Registered names, sorted.
pub fn extension_names() -> Vec<String> {
    let mut names: Vec<String> = EXTENSIONS.iter().map(|entry| entry.key().clone()).collect();
    names.sort();
    names
}

/// Expose every registered extension as a global of `registry`.
pub fn install_extensions(registry: &mut ModuleRegistry) -> usize {
    let names = extension_names();
    for name in &names {
        if let Some(value) = extension(name) {
            registry.register_builtin(name, value);
        }
    }
    names.len()
}

#[derive(Debug, Default)]
pub struct ExtensionModule;

impl ExtensionModule {
    pub fn new() -> Self {
        Self
    }
}

impl Module for ExtensionModule {
    fn name(&self) -> &str {
        "ext"
    }

    fn description(&self) -> &str {
        "Lookup of host-registered extension functions"
    }

    fn register(&self, registry: &mut ModuleRegistry) -> Result<()> {
        for (name, value) in self.exports() {
            registry.register_builtin(&format!("{}::{}", self.name(), name), value);
        }
        Ok(())
    }

    fn exports(&self) -> HashMap<String, Val> {
        let natives: [(&str, NativeFn); 3] = [("get", ext_get), ("has", ext_has), ("names", ext_names)];
        natives
            .into_iter()
            .map(|(name, func)| (name.to_string(), Val::native(name, func)))
            .collect()
    }
}

fn name_arg<'a>(args: &'a [Val], func: &str) -> Result<&'a str> {
    args.first()
        .and_then(Val::as_str)
        .ok_or_else(|| anyhow!("ext::{func}() expects an extension name"))
}

/// ext::get(name): the extension as a callable value, or nil.
fn ext_get(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    Ok(extension(name_arg(args, "get")?).unwrap_or_else(Val::nil))
}

fn ext_has(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    Ok(Val::bool(EXTENSIONS.contains_key(name_arg(args, "has")?)))
}

fn ext_names(_args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    Ok(Val::array(extension_names().into_iter().map(Val::str).collect()))
}
