use std::fmt;
use std::sync::Arc;

use anyhow::{Result, bail};

use crate::val::{Phase, Val, ValKind};

/// Register operand (index into the active frame's window).
pub type Reg = u16;
/// Constant pool index.
pub type ConstIdx = u16;

/// How a `Closure` instruction captures one variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    /// Alias a register of the enclosing frame (open upvalue).
    Local,
    /// Share one of the enclosing closure's upvalues.
    Upvalue,
    /// Deep-clone a register of the enclosing frame at capture time.
    Copy,
}

/// Where a phase operation finds its variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarLoc {
    Local,
    Upvalue,
    Global,
}

/// Declared phase requirement of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhaseConstraint {
    #[default]
    Any,
    Fluid,
    Crystal,
}

impl PhaseConstraint {
    /// Whether an argument in `phase` may bind to this parameter.
    pub fn admits(self, phase: Phase) -> bool {
        !matches!(
            (self, phase),
            (PhaseConstraint::Fluid, Phase::Crystal) | (PhaseConstraint::Crystal, Phase::Fluid)
        )
    }

    /// Overload score contribution for one argument.
    pub fn score(self, phase: Phase) -> u32 {
        match (self, phase) {
            (PhaseConstraint::Fluid, Phase::Fluid) | (PhaseConstraint::Crystal, Phase::Crystal) => 3,
            (PhaseConstraint::Any, Phase::Unphased) => 2,
            _ => 1,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Move(Reg, Reg),
    LoadK(Reg, ConstIdx),
    LoadInt(Reg, i32),
    LoadNil(Reg),
    LoadTrue(Reg),
    LoadFalse(Reg),
    LoadUnit(Reg),

    // Arithmetic with numeric promotion: dst, lhs, rhs
    Add(Reg, Reg, Reg),
    Sub(Reg, Reg, Reg),
    Mul(Reg, Reg, Reg),
    Div(Reg, Reg, Reg),
    Mod(Reg, Reg, Reg),
    Neg(Reg, Reg),
    AddImm(Reg, Reg, i16),
    Concat(Reg, Reg, Reg),

    // Integer fast paths: operands are assumed Int, checked only in debug builds
    AddInt(Reg, Reg, Reg),
    SubInt(Reg, Reg, Reg),
    MulInt(Reg, Reg, Reg),
    LtInt(Reg, Reg, Reg),
    LtEqInt(Reg, Reg, Reg),
    IncReg(Reg),
    DecReg(Reg),

    Eq(Reg, Reg, Reg),
    NotEq(Reg, Reg, Reg),
    Lt(Reg, Reg, Reg),
    LtEq(Reg, Reg, Reg),
    Gt(Reg, Reg, Reg),
    GtEq(Reg, Reg, Reg),
    Not(Reg, Reg),

    BitAnd(Reg, Reg, Reg),
    BitOr(Reg, Reg, Reg),
    BitXor(Reg, Reg, Reg),
    BitNot(Reg, Reg),
    Shl(Reg, Reg, Reg),
    Shr(Reg, Reg, Reg),

    // Jump offsets are relative to the instruction after the jump
    Jmp(i32),
    JmpFalse(Reg, i32),
    JmpTrue(Reg, i32),
    JmpNotNil(Reg, i32),

    DefineGlobal(Reg, ConstIdx),
    GetGlobal(Reg, ConstIdx),
    SetGlobal(Reg, ConstIdx),

    GetUpvalue(Reg, u16),
    SetUpvalue(Reg, u16),
    CloseUpvalue(Reg),

    GetField(Reg, Reg, ConstIdx),
    SetField(Reg, ConstIdx, Reg),
    GetIndex(Reg, Reg, Reg),
    SetIndex(Reg, Reg, Reg),
    Len(Reg, Reg),

    /// Call `R[func]` with `argc` arguments in `R[func+1..]`; the result lands in `R[func]`.
    Call {
        func: Reg,
        argc: u16,
    },
    Return(Reg),
    /// Build a closure from prototype `proto`; followed by `captures` `Capture` words.
    Closure {
        dst: Reg,
        proto: u16,
        captures: u16,
    },
    Capture(CaptureKind, u16),

    NewArray {
        dst: Reg,
        base: Reg,
        count: u16,
    },
    NewTuple {
        dst: Reg,
        base: Reg,
        count: u16,
    },
    /// Key/value pairs in `R[base..base+2*count]`.
    NewMap {
        dst: Reg,
        base: Reg,
        count: u16,
    },
    NewSet {
        dst: Reg,
        base: Reg,
        count: u16,
    },
    NewStruct {
        dst: Reg,
        name: ConstIdx,
        base: Reg,
        count: u16,
    },
    NewEnum {
        dst: Reg,
        name: ConstIdx,
        variant: ConstIdx,
        base: Reg,
        count: u16,
    },
    BuildRange(Reg, Reg, Reg),
    NewRef(Reg, Reg),
    NewBuffer(Reg, Reg),

    /// `R[dst] = R[obj].method(R[base..base+argc])`; the receiver may be mutated in place.
    Invoke {
        dst: Reg,
        obj: Reg,
        method: ConstIdx,
        base: Reg,
        argc: u16,
    },

    IterInit(Reg, Reg),
    /// `R[dst] = next(R[iter])`; jumps by `offset` when exhausted.
    IterNext {
        dst: Reg,
        iter: Reg,
        offset: i32,
    },

    Freeze(Reg, Reg),
    Thaw(Reg, Reg),
    Clone(Reg, Reg),
    MarkFluid(Reg),
    IsCrystal(Reg, Reg),
    IsFluid(Reg, Reg),

    /// Register a handler resuming at `ip + offset`, binding the error into `R[reg]`.
    PushHandler {
        reg: Reg,
        offset: i32,
    },
    PopHandler,
    Throw(Reg),
    TryUnwrap(Reg),

    /// Register the body starting at the next instruction and skip `offset` past it.
    DeferPush {
        depth: u8,
        offset: i32,
    },
    /// Run this frame's defers with scope depth `>= min_depth` (0 runs all).
    DeferRun(u8),
    /// End of a defer body.
    DeferEnd,

    /// `R[dst] = [args from position `from` onward]`.
    CollectVarargs {
        dst: Reg,
        from: u16,
    },

    FreezeVar {
        name: ConstIdx,
        loc: VarLoc,
        slot: u16,
        consume_seeds: bool,
    },
    ThawVar {
        name: ConstIdx,
        loc: VarLoc,
        slot: u16,
    },
    SublimateVar {
        name: ConstIdx,
        loc: VarLoc,
        slot: u16,
    },
    /// Register callback `R[callback]` on the variable named by `R[name]`.
    React {
        name: Reg,
        callback: Reg,
    },
    Unreact(Reg),
    /// `K[target]` depends on the variable named by `R[dep]` with strategy `R[strategy]`.
    Bond {
        target: ConstIdx,
        dep: Reg,
        strategy: Reg,
    },
    Unbond {
        target: ConstIdx,
        dep: Reg,
    },
    Seed {
        name: Reg,
        contract: Reg,
    },
    Unseed(Reg),

    Import(Reg, ConstIdx),
    /// `R[base]` = sync body (or nil), `R[base+1..=base+spawns]` = spawned closures.
    Scope {
        dst: Reg,
        base: Reg,
        spawns: u16,
    },
    /// `arms` pairs of (channel | nil for default | Int ms for timeout, handler) from `R[base]`.
    Select {
        dst: Reg,
        base: Reg,
        arms: u16,
    },
    ResetEphemeral,
    Print {
        base: Reg,
        count: u16,
    },
    Halt,
}

impl Op {
    /// One past the highest register this instruction touches.
    pub fn register_extent(&self) -> u16 {
        let top = |regs: &[Reg]| regs.iter().map(|r| r.saturating_add(1)).max().unwrap_or(0);
        let run = |base: Reg, len: u16| base.saturating_add(len).max(base.saturating_add(1));
        match *self {
            Op::Move(a, b)
            | Op::Neg(a, b)
            | Op::Not(a, b)
            | Op::BitNot(a, b)
            | Op::Len(a, b)
            | Op::GetField(a, b, _)
            | Op::SetField(a, _, b)
            | Op::NewRef(a, b)
            | Op::NewBuffer(a, b)
            | Op::IterInit(a, b)
            | Op::Freeze(a, b)
            | Op::Thaw(a, b)
            | Op::Clone(a, b)
            | Op::IsCrystal(a, b)
            | Op::IsFluid(a, b)
            | Op::AddImm(a, b, _) => top(&[a, b]),
            Op::LoadK(a, _)
            | Op::LoadInt(a, _)
            | Op::LoadNil(a)
            | Op::LoadTrue(a)
            | Op::LoadFalse(a)
            | Op::LoadUnit(a)
            | Op::IncReg(a)
            | Op::DecReg(a)
            | Op::JmpFalse(a, _)
            | Op::JmpTrue(a, _)
            | Op::JmpNotNil(a, _)
            | Op::DefineGlobal(a, _)
            | Op::GetGlobal(a, _)
            | Op::SetGlobal(a, _)
            | Op::GetUpvalue(a, _)
            | Op::SetUpvalue(a, _)
            | Op::CloseUpvalue(a)
            | Op::Return(a)
            | Op::MarkFluid(a)
            | Op::Throw(a)
            | Op::TryUnwrap(a)
            | Op::Unreact(a)
            | Op::Unseed(a)
            | Op::Import(a, _)
            | Op::Closure { dst: a, .. }
            | Op::CollectVarargs { dst: a, .. }
            | Op::PushHandler { reg: a, .. } => top(&[a]),
            Op::Add(a, b, c)
            | Op::Sub(a, b, c)
            | Op::Mul(a, b, c)
            | Op::Div(a, b, c)
            | Op::Mod(a, b, c)
            | Op::Concat(a, b, c)
            | Op::AddInt(a, b, c)
            | Op::SubInt(a, b, c)
            | Op::MulInt(a, b, c)
            | Op::LtInt(a, b, c)
            | Op::LtEqInt(a, b, c)
            | Op::Eq(a, b, c)
            | Op::NotEq(a, b, c)
            | Op::Lt(a, b, c)
            | Op::LtEq(a, b, c)
            | Op::Gt(a, b, c)
            | Op::GtEq(a, b, c)
            | Op::BitAnd(a, b, c)
            | Op::BitOr(a, b, c)
            | Op::BitXor(a, b, c)
            | Op::Shl(a, b, c)
            | Op::Shr(a, b, c)
            | Op::GetIndex(a, b, c)
            | Op::SetIndex(a, b, c)
            | Op::BuildRange(a, b, c) => top(&[a, b, c]),
            Op::Call { func, argc } => run(func, argc.saturating_add(1)),
            Op::NewArray { dst, base, count }
            | Op::NewTuple { dst, base, count }
            | Op::NewSet { dst, base, count }
            | Op::NewStruct { dst, base, count, .. }
            | Op::NewEnum { dst, base, count, .. } => top(&[dst]).max(run(base, count)),
            Op::NewMap { dst, base, count } | Op::Select { dst, base, arms: count } => {
                top(&[dst]).max(run(base, count.saturating_mul(2)))
            }
            Op::Scope { dst, base, spawns } => top(&[dst]).max(run(base, spawns.saturating_add(1))),
            Op::Invoke { dst, obj, base, argc, .. } => top(&[dst, obj]).max(run(base, argc)),
            Op::IterNext { dst, iter, .. } => top(&[dst, iter]),
            Op::React { name, callback } => top(&[name, callback]),
            Op::Bond { dep, strategy, .. } => top(&[dep, strategy]),
            Op::Unbond { dep, .. } => top(&[dep]),
            Op::Seed { name, contract } => top(&[name, contract]),
            Op::Print { base, count } => run(base, count),
            Op::FreezeVar { loc, slot, .. } | Op::ThawVar { loc, slot, .. } | Op::SublimateVar { loc, slot, .. } => {
                if loc == VarLoc::Local { top(&[slot]) } else { 0 }
            }
            Op::Jmp(_)
            | Op::Capture(..)
            | Op::PopHandler
            | Op::DeferPush { .. }
            | Op::DeferRun(_)
            | Op::DeferEnd
            | Op::ResetEphemeral
            | Op::Halt => 0,
        }
    }
}

/// Field layout registered in struct metadata when a chunk is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDecl {
    pub name: Arc<str>,
    pub fields: Vec<Arc<str>>,
}

/// Compiled code unit.
///
/// Register 0 of every call window is reserved; parameters occupy
/// registers `1..=arity`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub name: Arc<str>,
    pub code: Vec<Op>,
    /// Source line per instruction.
    pub lines: Vec<u32>,
    pub consts: Vec<Val>,
    pub protos: Vec<Arc<Chunk>>,
    /// Register slot -> local variable name.
    pub local_names: Vec<Option<Arc<str>>>,
    pub arity: u16,
    pub variadic: bool,
    /// Default values for the trailing parameters.
    pub defaults: Vec<Val>,
    pub param_phases: Vec<PhaseConstraint>,
    /// Names exported when loaded as a module; `None` exports every global it defines.
    pub exports: Option<Vec<Arc<str>>>,
    pub structs: Vec<StructDecl>,
    pub max_regs: u16,
}

impl Chunk {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            max_regs: 1,
            ..Default::default()
        }
    }

    #[inline]
    pub fn line_at(&self, ip: usize) -> u32 {
        self.lines.get(ip).copied().unwrap_or(0)
    }

    pub fn local_name(&self, slot: usize) -> Option<&Arc<str>> {
        self.local_names.get(slot).and_then(Option::as_ref)
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        (1..=self.arity as usize).map(|slot| self.local_name(slot).map(|n| n.as_ref()).unwrap_or("_"))
    }

    /// Append a constant, reusing an identical Str/Int/Float entry.
    pub fn add_constant(&mut self, value: Val) -> Result<ConstIdx> {
        let existing = self.consts.iter().position(|k| match (&k.kind, &value.kind) {
            (ValKind::Str(a), ValKind::Str(b)) => a == b,
            (ValKind::Int(a), ValKind::Int(b)) => a == b,
            (ValKind::Float(a), ValKind::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        });
        let idx = match existing {
            Some(idx) => idx,
            None => {
                if !is_constant_kind(&value.kind) {
                    bail!("{} cannot be stored in a constant pool", value.type_name());
                }
                self.consts.push(value);
                self.consts.len() - 1
            }
        };
        u16::try_from(idx).map_err(|_| anyhow::anyhow!("constant pool overflow"))
    }

    pub fn const_str(&self, idx: ConstIdx) -> Result<&Arc<str>> {
        match self.consts.get(idx as usize).map(|v| &v.kind) {
            Some(ValKind::Str(s)) => Ok(s),
            Some(_) => bail!("constant {idx} is not a string"),
            None => bail!("constant index {idx} out of range"),
        }
    }
}

/// Kinds that may live in a constant pool (and therefore in an artifact).
pub(crate) fn is_constant_kind(kind: &ValKind) -> bool {
    matches!(
        kind,
        ValKind::Nil | ValKind::Unit | ValKind::Bool(_) | ValKind::Int(_) | ValKind::Float(_) | ValKind::Str(_)
    )
}

impl fmt::Display for Chunk {
    /// Disassembly listing.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "== {} (arity {}{}, regs {}) ==",
            self.name,
            self.arity,
            if self.variadic { ", variadic" } else { "" },
            self.max_regs
        )?;
        for (idx, k) in self.consts.iter().enumerate() {
            writeln!(f, "  K{idx:<4} {}", k.repr())?;
        }
        let mut last_line = None;
        for (ip, op) in self.code.iter().enumerate() {
            let line = self.line_at(ip);
            if last_line == Some(line) {
                write!(f, "{ip:04}    | ")?;
            } else {
                write!(f, "{ip:04} {line:>4} ")?;
                last_line = Some(line);
            }
            writeln!(f, "{op:?}")?;
        }
        for proto in &self.protos {
            writeln!(f)?;
            write!(f, "{proto}")?;
        }
        Ok(())
    }
}
