use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use tracing::debug;

use crate::rt::phase::{fire_reactions, freeze_cascade, validate_seeds};
use crate::rt::{BondStrategy, RuntimeCallbacks};
use crate::val::{Phase, Val, ValKind};
use crate::vm::bytecode::{ConstIdx, Reg, VarLoc};
use crate::vm::vm::Vm;

impl Vm {
    fn read_var(&self, fi: usize, name: &str, loc: VarLoc, slot: u16) -> Result<Val> {
        match loc {
            VarLoc::Local => Ok(self.regs[self.frames[fi].base + slot as usize].clone()),
            VarLoc::Upvalue => {
                let cell = self.frames[fi]
                    .upvalues()
                    .get(slot as usize)
                    .ok_or_else(|| anyhow!("upvalue index {slot} out of range"))?;
                Ok(self.upvalue_value(cell))
            }
            VarLoc::Global => self
                .rt
                .globals
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("undefined variable '{name}'")),
        }
    }

    fn write_var(&mut self, fi: usize, name: &str, loc: VarLoc, slot: u16, value: Val) -> Result<()> {
        match loc {
            VarLoc::Local => {
                let abs = self.frames[fi].base + slot as usize;
                self.set_reg(abs, value);
            }
            VarLoc::Upvalue => {
                let Some(cell) = self.frames[fi].upvalues().get(slot as usize).cloned() else {
                    bail!("upvalue index {slot} out of range");
                };
                self.write_upvalue(&cell, value);
            }
            VarLoc::Global => {
                self.rt.globals.insert(name, value);
            }
        }
        Ok(())
    }

    fn phase_history(&mut self, name: &str, value: &Val) {
        let line = self.line();
        let function = self.frames.last().map(|f| f.chunk.name.clone());
        self.rt.record_history(name, value, line, function.as_deref());
    }

    /// Gate bonds refuse the freeze before anything is written.
    fn check_gates(&self, name: &str) -> Result<()> {
        for bond in self.rt.bonds(name) {
            if bond.strategy != BondStrategy::Gate {
                continue;
            }
            let ready = self
                .get_var_by_name(&bond.dep)
                .is_some_and(|v| v.phase == Phase::Crystal);
            if !ready {
                bail!("gate bond: '{}' must be crystal before '{name}' can freeze", bond.dep);
            }
        }
        Ok(())
    }

    pub(super) fn freeze_var(&mut self, fi: usize, name: ConstIdx, loc: VarLoc, slot: u16, consume: bool) -> Result<()> {
        let name = self.kstr(fi, name)?;
        let mut value = self.read_var(fi, &name, loc, slot)?;
        if matches!(value.kind, ValKind::Channel(_)) {
            bail!("cannot freeze a channel");
        }
        validate_seeds(self, &name, &value, consume)?;
        self.check_gates(&name)?;
        value.freeze();
        self.write_var(fi, &name, loc, slot, value.clone())?;
        debug!(target: "lattice::vm::phase", name = %name, "phase.freeze");
        freeze_cascade(self, &name)?;
        fire_reactions(self, &name, Phase::Crystal, &value)?;
        self.phase_history(&name, &value);
        Ok(())
    }

    pub(super) fn thaw_var(&mut self, fi: usize, name: ConstIdx, loc: VarLoc, slot: u16) -> Result<()> {
        let name = self.kstr(fi, name)?;
        let value = self.read_var(fi, &name, loc, slot)?.thawed();
        self.write_var(fi, &name, loc, slot, value.clone())?;
        debug!(target: "lattice::vm::phase", name = %name, "phase.thaw");
        fire_reactions(self, &name, Phase::Fluid, &value)?;
        self.phase_history(&name, &value);
        Ok(())
    }

    pub(super) fn sublimate_var(&mut self, fi: usize, name: ConstIdx, loc: VarLoc, slot: u16) -> Result<()> {
        let name = self.kstr(fi, name)?;
        let mut value = self.read_var(fi, &name, loc, slot)?;
        value.sublimate();
        self.write_var(fi, &name, loc, slot, value.clone())?;
        debug!(target: "lattice::vm::phase", name = %name, "phase.sublimate");
        fire_reactions(self, &name, Phase::Sublimated, &value)?;
        self.phase_history(&name, &value);
        Ok(())
    }

    fn name_operand(&self, base: usize, r: Reg, what: &str) -> Result<Arc<str>> {
        match &self.regs[base + r as usize].kind {
            ValKind::Str(name) => Ok(name.clone()),
            _ => bail!("{what}() requires a variable name"),
        }
    }

    pub(super) fn react(&mut self, base: usize, name: Reg, callback: Reg) -> Result<()> {
        let name = self.name_operand(base, name, "react")?;
        let callback = self.regs[base + callback as usize].clone();
        if callback.as_closure().is_some() {
            self.rt.add_reaction(&name, callback);
        }
        Ok(())
    }

    pub(super) fn unreact(&mut self, base: usize, name: Reg) -> Result<()> {
        let name = self.name_operand(base, name, "unreact")?;
        self.rt.remove_reactions(&name);
        Ok(())
    }

    pub(super) fn bond(&mut self, fi: usize, target: ConstIdx, dep: Reg, strategy: Reg) -> Result<()> {
        let target = self.kstr(fi, target)?;
        let base = self.frames[fi].base;
        let dep = match &self.regs[base + dep as usize].kind {
            ValKind::Str(dep) if !dep.is_empty() => dep.clone(),
            _ => bail!("bond() requires variable names for dependencies"),
        };
        let strategy = match &self.regs[base + strategy as usize].kind {
            ValKind::Str(s) => BondStrategy::from_name(s).ok_or_else(|| anyhow!("bond: unknown strategy '{s}'"))?,
            ValKind::Nil | ValKind::Unit => BondStrategy::Mirror,
            _ => bail!("bond: strategy must be a string"),
        };
        if self.get_var_by_name(&target).is_some_and(|v| v.phase == Phase::Crystal) {
            bail!("bond: variable '{target}' is already frozen");
        }
        if self.get_var_by_name(&dep).is_none() {
            bail!("bond: undefined variable '{dep}'");
        }
        self.rt.add_bond(&target, &dep, strategy);
        Ok(())
    }

    pub(super) fn unbond(&mut self, fi: usize, target: ConstIdx, dep: Reg) -> Result<()> {
        let target = self.kstr(fi, target)?;
        let base = self.frames[fi].base;
        let dep = self.name_operand(base, dep, "unbond")?;
        self.rt.remove_bond(&target, &dep);
        Ok(())
    }

    pub(super) fn seed(&mut self, base: usize, name: Reg, contract: Reg) -> Result<()> {
        let name = self.name_operand(base, name, "seed")?;
        let contract = self.regs[base + contract as usize].clone();
        if contract.as_closure().is_some() {
            self.rt.add_seed(&name, contract);
        }
        Ok(())
    }

    pub(super) fn unseed(&mut self, base: usize, name: Reg) -> Result<()> {
        let name = self.name_operand(base, name, "unseed")?;
        self.rt.remove_seed(&name);
        Ok(())
    }
}
