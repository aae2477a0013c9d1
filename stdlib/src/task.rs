//! Task module for Lattice
//!
//! Helpers around the scheduler that runs `scope`/`spawn` bodies.

use anyhow::{Result, anyhow};
use lattice_core::module::{Module, ModuleRegistry};
use lattice_core::rt::{self, Host};
use lattice_core::val::{NativeFn, Val};
use std::collections::HashMap;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Default)]
pub struct TaskModule;

impl TaskModule {
    pub fn new() -> Self {
        Self
    }
}

impl Module for TaskModule {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Task scheduling helpers"
    }

    fn register(&self, registry: &mut ModuleRegistry) -> Result<()> {
        for (name, value) in self.exports() {
            registry.register_builtin(&format!("{}::{}", self.name(), name), value);
        }
        Ok(())
    }

    fn exports(&self) -> HashMap<String, Val> {
        let natives: [(&str, NativeFn); 2] = [("sleep", task_sleep), ("stats", task_stats)];
        natives
            .into_iter()
            .map(|(name, func)| (name.to_string(), Val::native(name, func)))
            .collect()
    }
}

/// Block the current task for the given number of milliseconds.
fn task_sleep(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let ms = args
        .first()
        .and_then(Val::as_int)
        .ok_or_else(|| anyhow!("task::sleep() expects milliseconds as an integer"))?;
    if ms < 0 {
        return Err(anyhow!("task::sleep() duration must be non-negative"));
    }
    trace!(target: "lattice::rt::task", ms, "task.sleep");
    std::thread::sleep(Duration::from_millis(ms as u64));
    Ok(Val::unit())
}

/// `{spawned, threaded}` for the process-wide scheduler.
fn task_stats(_args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let stats = rt::scheduler().stats();
    Ok(Val::map_from([
        ("spawned", Val::int(stats.spawned as i64)),
        ("threaded", Val::bool(stats.is_multi_threaded)),
    ]))
}
