//! Programmatic assembler for [`Chunk`]s.
//!
//! The front-end compiler lives outside this crate; hosts and tests use the
//! builder to produce code units with patched jumps, a deduplicated constant
//! pool and a line table that stays parallel to the instruction stream.

use std::sync::Arc;

use anyhow::{Result, bail};

use crate::val::Val;

use super::bytecode::{CaptureKind, Chunk, ConstIdx, Op, PhaseConstraint, Reg, StructDecl};
use super::frame::REGS_PER_WINDOW;

/// Position of an emitted forward jump awaiting its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "forward jumps must be patched"]
pub struct JumpLabel(usize);

pub struct ChunkBuilder {
    chunk: Chunk,
    line: u32,
    next_reg: u16,
}

impl ChunkBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            chunk: Chunk::new(name),
            line: 1,
            next_reg: 1,
        }
    }

    pub fn set_line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    /// Declare the next parameter; parameters occupy registers `1..=arity`.
    pub fn param(&mut self, name: &str) -> Reg {
        self.param_with_phase(name, PhaseConstraint::Any)
    }

    pub fn param_with_phase(&mut self, name: &str, phase: PhaseConstraint) -> Reg {
        let reg = self.local(name);
        self.chunk.arity += 1;
        self.chunk.param_phases.push(phase);
        reg
    }

    /// Default value for the most recently declared trailing parameter(s), in order.
    pub fn default_value(&mut self, value: Val) -> &mut Self {
        self.chunk.defaults.push(value);
        self
    }

    /// Extra arguments beyond the arity are packed into an array in the last parameter.
    pub fn variadic(&mut self) -> &mut Self {
        self.chunk.variadic = true;
        self
    }

    pub fn alloc(&mut self) -> Reg {
        let reg = self.next_reg;
        self.next_reg = self.next_reg.saturating_add(1);
        self.chunk.max_regs = self.chunk.max_regs.max(self.next_reg);
        reg
    }

    /// Allocate `count` consecutive registers and return the first.
    pub fn alloc_run(&mut self, count: u16) -> Reg {
        let base = self.next_reg;
        for _ in 0..count {
            self.alloc();
        }
        base
    }

    /// Allocate a register and record its name for debuggers and `find_local_value`.
    pub fn local(&mut self, name: &str) -> Reg {
        let reg = self.alloc();
        self.name_slot(reg, name);
        reg
    }

    pub fn name_slot(&mut self, reg: Reg, name: &str) {
        let slot = reg as usize;
        if self.chunk.local_names.len() <= slot {
            self.chunk.local_names.resize(slot + 1, None);
        }
        self.chunk.local_names[slot] = Some(Arc::from(name));
    }

    pub fn k(&mut self, value: Val) -> Result<ConstIdx> {
        self.chunk.add_constant(value)
    }

    pub fn k_str(&mut self, value: &str) -> Result<ConstIdx> {
        self.k(Val::str(value))
    }

    pub fn emit(&mut self, op: Op) -> usize {
        self.chunk.max_regs = self.chunk.max_regs.max(op.register_extent());
        self.chunk.code.push(op);
        self.chunk.lines.push(self.line);
        self.chunk.code.len() - 1
    }

    /// Emit a jump-carrying instruction whose offset is patched later.
    pub fn emit_jump(&mut self, op: Op) -> JumpLabel {
        JumpLabel(self.emit(op))
    }

    /// Point a forward jump at the next instruction to be emitted.
    pub fn patch(&mut self, label: JumpLabel) -> Result<()> {
        let target = self.chunk.code.len();
        self.patch_to(label, target)
    }

    pub fn patch_to(&mut self, label: JumpLabel, target: usize) -> Result<()> {
        let offset = relative_offset(label.0, target)?;
        let Some(op) = self.chunk.code.get_mut(label.0) else {
            bail!("jump label {} out of range", label.0);
        };
        match op {
            Op::Jmp(o)
            | Op::JmpFalse(_, o)
            | Op::JmpTrue(_, o)
            | Op::JmpNotNil(_, o)
            | Op::PushHandler { offset: o, .. }
            | Op::DeferPush { offset: o, .. }
            | Op::IterNext { offset: o, .. } => *o = offset,
            other => bail!("instruction {other:?} carries no jump offset"),
        }
        Ok(())
    }

    /// Index of the next instruction, used as a backward jump target.
    pub fn here(&self) -> usize {
        self.chunk.code.len()
    }

    /// Emit an unconditional jump back to `target`.
    pub fn jump_back(&mut self, target: usize) -> Result<()> {
        let at = self.here();
        let offset = relative_offset(at, target)?;
        self.emit(Op::Jmp(offset));
        Ok(())
    }

    pub fn proto(&mut self, chunk: Chunk) -> Result<u16> {
        let idx = self.chunk.protos.len();
        let Ok(idx) = u16::try_from(idx) else {
            bail!("too many nested functions in '{}'", self.chunk.name);
        };
        self.chunk.protos.push(Arc::new(chunk));
        Ok(idx)
    }

    /// Emit `Closure` followed by its capture descriptors.
    pub fn closure(&mut self, dst: Reg, proto: u16, captures: &[(CaptureKind, u16)]) -> Result<()> {
        let Ok(count) = u16::try_from(captures.len()) else {
            bail!("too many captures");
        };
        self.emit(Op::Closure {
            dst,
            proto,
            captures: count,
        });
        for &(kind, index) in captures {
            self.emit(Op::Capture(kind, index));
        }
        Ok(())
    }

    pub fn export(&mut self, name: &str) -> &mut Self {
        self.chunk.exports.get_or_insert_with(Vec::new).push(Arc::from(name));
        self
    }

    pub fn declare_struct(&mut self, name: &str, fields: &[&str]) -> &mut Self {
        self.chunk.structs.push(StructDecl {
            name: Arc::from(name),
            fields: fields.iter().map(|f| Arc::from(*f)).collect(),
        });
        self
    }

    pub fn finish(mut self) -> Result<Chunk> {
        if self.chunk.defaults.len() > self.chunk.arity as usize {
            bail!(
                "'{}' declares {} defaults for {} parameters",
                self.chunk.name,
                self.chunk.defaults.len(),
                self.chunk.arity
            );
        }
        if self.chunk.max_regs as usize > REGS_PER_WINDOW {
            bail!("'{}' needs {} registers (limit {})", self.chunk.name, self.chunk.max_regs, REGS_PER_WINDOW);
        }
        self.chunk.max_regs = self.chunk.max_regs.max(self.chunk.arity + 1);
        Ok(self.chunk)
    }
}

/// Offset from the instruction after `from` to `target`.
fn relative_offset(from: usize, target: usize) -> Result<i32> {
    let delta = target as i64 - (from as i64 + 1);
    i32::try_from(delta).map_err(|_| anyhow::anyhow!("jump distance {delta} out of range"))
}
