//! Phase transitions that call back into script code: reactions, bond
//! cascades and seed contracts.

use anyhow::{Result, anyhow, bail};
use tracing::debug;

use crate::val::{Phase, Val, ValKind};

use super::callbacks::Host;
use super::services::BondStrategy;

/// Call every reaction registered on `name` with `(phase_name, value)`.
pub fn fire_reactions(host: &mut dyn Host, name: &str, phase: Phase, value: &Val) -> Result<()> {
    let callbacks = match host.runtime_ref().reactions.get(name) {
        Some(callbacks) if !callbacks.is_empty() => callbacks.clone(),
        _ => return Ok(()),
    };
    debug!(
        target: "lattice::rt::phase",
        name,
        phase = phase.name(),
        count = callbacks.len(),
        "phase.react"
    );
    for callback in &callbacks {
        let args = [Val::str(phase.name()), value.clone()];
        host.call_closure(callback, &args)
            .map_err(|e| anyhow!("reaction error: {}", root_message(&e)))?;
    }
    Ok(())
}

/// Propagate a freeze of `target` through its bonds. Bonds are one-shot: the
/// target's bond list is consumed.
pub fn freeze_cascade(host: &mut dyn Host, target: &str) -> Result<()> {
    let Some(bonds) = host.runtime().bonds.remove(target) else {
        return Ok(());
    };
    let line = host.current_line();
    for bond in bonds {
        let dep = bond.dep.as_ref();
        let Some(mut value) = host.get_var_by_name(dep) else {
            continue;
        };
        if matches!(value.kind, ValKind::Channel(_)) {
            continue;
        }
        debug!(target: "lattice::rt::phase", target, dep, strategy = bond.strategy.name(), "phase.bond");
        match bond.strategy {
            BondStrategy::Mirror => {
                if value.phase == Phase::Crystal {
                    continue;
                }
                value.freeze();
                host.set_var_by_name(dep, value.clone());
                let function = host.current_function().to_string();
                host.runtime().record_history(dep, &value, line, Some(&function));
                fire_reactions(host, dep, Phase::Crystal, &value)?;
                freeze_cascade(host, dep)?;
            }
            BondStrategy::Inverse => {
                if !value.is_frozen() {
                    continue;
                }
                let thawed = value.thawed();
                host.set_var_by_name(dep, thawed.clone());
                let function = host.current_function().to_string();
                host.runtime().record_history(dep, &thawed, line, Some(&function));
                fire_reactions(host, dep, Phase::Fluid, &thawed)?;
            }
            BondStrategy::Gate => {
                if value.phase != Phase::Crystal {
                    bail!("gate bond: '{dep}' must be crystal before '{target}' can freeze");
                }
            }
        }
    }
    Ok(())
}

/// Check every seed contract planted on `name` against `value`.
/// Consumed seeds are removed when `consume` is set.
pub fn validate_seeds(host: &mut dyn Host, name: &str, value: &Val, consume: bool) -> Result<()> {
    let contracts = match host.runtime_ref().seeds.get(name) {
        Some(contracts) => contracts.clone(),
        None => return Ok(()),
    };
    for contract in &contracts {
        let verdict = host
            .call_closure(contract, std::slice::from_ref(value))
            .map_err(|e| anyhow!("seed contract failed: {}", root_message(&e)))?;
        if !verdict.is_truthy() {
            bail!("grow() seed contract returned false");
        }
    }
    if consume {
        host.runtime().seeds.remove(name);
    }
    Ok(())
}

/// Message of the innermost engine error, without line decoration.
fn root_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<crate::vm::RuntimeError>() {
        Some(rt) => rt.message.clone(),
        None => err.to_string(),
    }
}
