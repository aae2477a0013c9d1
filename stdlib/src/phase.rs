//! Phase module for Lattice
//!
//! Temporal tracking, pressure and the `grow` freeze entry point. Every
//! function is also registered as a global.

use anyhow::{Result, anyhow, bail};
use lattice_core::module::{Module, ModuleRegistry};
use lattice_core::rt::{Host, PressureMode, phase};
use lattice_core::util::lat_map::LatMap;
use lattice_core::val::{Phase, Val};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct PhaseModule;

impl PhaseModule {
    pub fn new() -> Self {
        Self
    }
}

impl Module for PhaseModule {
    fn name(&self) -> &str {
        "phase"
    }

    fn description(&self) -> &str {
        "Phase tracking, pressure and freeze helpers"
    }

    fn register(&self, registry: &mut ModuleRegistry) -> Result<()> {
        for (name, value) in self.exports() {
            registry.register_builtin(&name, value);
        }
        Ok(())
    }

    fn exports(&self) -> HashMap<String, Val> {
        let natives: [(&str, lattice_core::val::NativeFn); 9] = [
            ("track", track),
            ("phases", history),
            ("history", history),
            ("rewind", rewind),
            ("pressurize", pressurize),
            ("depressurize", depressurize),
            ("pressure_of", pressure_of),
            ("grow", grow),
            ("phase_of", phase_of),
        ];
        natives
            .into_iter()
            .map(|(name, func)| (name.to_string(), Val::native(name, func)))
            .collect()
    }
}

fn name_arg<'a>(args: &'a [Val], func: &str) -> Result<&'a str> {
    args.first()
        .and_then(Val::as_str)
        .ok_or_else(|| anyhow!("{func}() expects a variable name string"))
}

/// track(name): start recording the variable's phase history.
fn track(args: &[Val], host: &mut dyn Host) -> Result<Val> {
    let name = name_arg(args, "track")?;
    if host.runtime_ref().is_tracked(name) {
        return Ok(Val::unit());
    }
    let Some(value) = host.get_var_by_name(name) else {
        bail!("track: undefined variable '{name}'");
    };
    let line = host.current_line();
    let function = host.current_function().to_string();
    let rt = host.runtime();
    rt.track(name);
    rt.record_history(name, &value, line, Some(&function));
    debug!(target: "lattice::rt::phase", name, "phase.track");
    Ok(Val::unit())
}

/// history(name) / phases(name): `[{phase, value, line, fn}, ...]`, oldest first.
fn history(args: &[Val], host: &mut dyn Host) -> Result<Val> {
    let name = name_arg(args, "history")?;
    let entries = host.runtime_ref().history(name).unwrap_or_default();
    let timeline = entries
        .iter()
        .map(|entry| {
            let mut m = LatMap::with_capacity(4);
            m.insert("phase", Val::str(entry.phase.name()));
            m.insert("value", entry.value.clone());
            m.insert("line", Val::int(i64::from(entry.line)));
            m.insert("fn", entry.function.clone().map_or_else(Val::nil, Val::str));
            Val::map(m)
        })
        .collect();
    Ok(Val::array(timeline))
}

/// rewind(name, steps): the value `steps` snapshots before the latest, or nil.
fn rewind(args: &[Val], host: &mut dyn Host) -> Result<Val> {
    let name = name_arg(args, "rewind")?;
    let steps = args
        .get(1)
        .and_then(Val::as_int)
        .ok_or_else(|| anyhow!("rewind() expects an integer step count"))?;
    let entries = host.runtime_ref().history(name).unwrap_or_default();
    let index = entries.len() as i64 - 1 - steps;
    if steps < 0 || index < 0 {
        return Ok(Val::nil());
    }
    Ok(entries[index as usize].value.clone())
}

/// pressurize(name, mode) with mode one of no_grow, no_shrink, no_resize, read_heavy.
fn pressurize(args: &[Val], host: &mut dyn Host) -> Result<Val> {
    let name = name_arg(args, "pressurize")?;
    let mode = args
        .get(1)
        .and_then(Val::as_str)
        .ok_or_else(|| anyhow!("pressurize() expects a mode string"))?;
    let Some(mode) = PressureMode::from_name(mode) else {
        bail!("pressurize: unknown mode '{mode}'");
    };
    host.runtime().set_pressure(name, mode);
    Ok(Val::unit())
}

fn depressurize(args: &[Val], host: &mut dyn Host) -> Result<Val> {
    let name = name_arg(args, "depressurize")?;
    host.runtime().clear_pressure(name);
    Ok(Val::unit())
}

fn pressure_of(args: &[Val], host: &mut dyn Host) -> Result<Val> {
    let name = name_arg(args, "pressure_of")?;
    Ok(host
        .runtime_ref()
        .pressure(name)
        .map_or_else(Val::nil, |mode| Val::str(mode.name())))
}

/// grow(name): validate and consume the seeds, freeze the variable in place,
/// then run its bonds and reactions. Returns the frozen value.
fn grow(args: &[Val], host: &mut dyn Host) -> Result<Val> {
    let name = name_arg(args, "grow")?;
    let Some(mut value) = host.get_var_by_name(name) else {
        bail!("grow: undefined variable '{name}'");
    };
    phase::validate_seeds(host, name, &value, true)?;
    value.freeze();
    host.set_var_by_name(name, value.clone());

    let line = host.current_line();
    let function = host.current_function().to_string();
    host.runtime().record_history(name, &value, line, Some(&function));
    phase::freeze_cascade(host, name)?;
    phase::fire_reactions(host, name, Phase::Crystal, &value)?;
    Ok(value)
}

fn phase_of(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    Ok(Val::str(args.first().map_or("unknown", |v| v.phase.name())))
}
