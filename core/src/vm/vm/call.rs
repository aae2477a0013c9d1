use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use tracing::trace;

use crate::val::{Callable, Closure, NativeFn, Phase, Val, ValKind};
use crate::vm::bytecode::{CaptureKind, Chunk, Op, Reg};
use crate::vm::error::{RuntimeError, fatal};
use crate::vm::frame::{CallFrame, FrameKind};
use crate::vm::upvalue::{UpvalueCell, UpvalueRef};
use crate::vm::vm::Vm;
use crate::vm::vm::exec::Step;

/// Where call arguments come from.
#[derive(Clone, Copy)]
pub(super) enum Args<'a> {
    /// A run of registers in the caller's window (absolute indices).
    Regs { start: usize, count: usize },
    Slice(&'a [Val]),
}

impl<'a> Args<'a> {
    fn len(&self) -> usize {
        match self {
            Args::Regs { count, .. } => *count,
            Args::Slice(args) => args.len(),
        }
    }

    fn at<'r>(&'r self, regs: &'r [Val], i: usize) -> &'r Val {
        match self {
            Args::Regs { start, .. } => &regs[start + i],
            Args::Slice(args) => &args[i],
        }
    }
}

impl Vm {
    pub(super) fn fatal(&self, message: &str) -> anyhow::Error {
        RuntimeError::fatal(message, self.line()).into()
    }

    /// Push a frame whose window starts at the top of the register file.
    pub(super) fn push_frame(
        &mut self,
        chunk: Arc<Chunk>,
        closure: Option<Arc<Closure>>,
        dest: Reg,
        kind: FrameKind,
    ) -> Result<()> {
        if self.frames.len() >= self.limits.frames {
            return Err(self.fatal(fatal::CALL_STACK));
        }
        let base = self.regs.len();
        let size = (chunk.max_regs.max(chunk.arity + 1)) as usize;
        if size > self.limits.registers_per_window || base + size > self.limits.register_file() {
            return Err(self.fatal(fatal::REGISTER_STACK));
        }
        self.regs.resize(base + size, Val::nil());
        self.frames.push(CallFrame {
            chunk,
            ip: 0,
            base,
            size,
            closure,
            dest,
            kind,
        });
        Ok(())
    }

    /// Bind `args` into a fresh frame for a compiled closure.
    pub(super) fn enter_closure(&mut self, closure: Arc<Closure>, args: Args<'_>, dest: Reg, kind: FrameKind) -> Result<()> {
        let Callable::Compiled { chunk, .. } = &closure.callable else {
            bail!("'{}' is not a compiled function", closure.name);
        };
        let chunk = chunk.clone();
        let argc = args.len();
        let violates = chunk
            .param_phases
            .iter()
            .enumerate()
            .take(argc)
            .any(|(i, constraint)| !constraint.admits(args.at(&self.regs, i).phase));
        if violates {
            bail!("phase constraint violation in function '{}'", chunk.name);
        }

        let base = self.regs.len();
        self.push_frame(chunk.clone(), Some(closure), dest, kind)?;
        let size = self.frames.last().map_or(0, |f| f.size);
        let arity = chunk.arity as usize;
        let fixed = if chunk.variadic { arity.saturating_sub(1) } else { arity };

        for i in 0..argc.min(fixed) {
            let value = args.at(&self.regs, i).clone();
            self.regs[base + 1 + i] = value;
        }
        if argc < fixed {
            let first_default = arity - chunk.defaults.len().min(arity);
            for p in argc.max(first_default)..fixed {
                self.regs[base + 1 + p] = chunk.defaults[p - first_default].clone();
            }
        }
        if chunk.variadic && arity > 0 {
            let rest = (fixed..argc).map(|i| args.at(&self.regs, i).clone()).collect();
            self.regs[base + arity] = Val::array(rest);
        } else {
            // Extra arguments stay reachable for `CollectVarargs`.
            for i in arity..argc {
                if 1 + i < size {
                    let value = args.at(&self.regs, i).clone();
                    self.regs[base + 1 + i] = value;
                }
            }
        }
        trace!(
            target: "lattice::vm::call",
            function = %chunk.name,
            argc,
            depth = self.frames.len(),
            "call.enter"
        );
        Ok(())
    }

    /// `Call` instruction: callee in `R[func]`, arguments above it, result
    /// back into `R[func]`.
    pub(super) fn op_call(&mut self, base: usize, func: Reg, argc: u16) -> Result<()> {
        let callee = self.regs[base + func as usize].clone();
        let start = base + func as usize + 1;
        self.dispatch_call(callee, start, argc as usize, base, func)
    }

    fn dispatch_call(&mut self, callee: Val, start: usize, count: usize, base: usize, dest: Reg) -> Result<()> {
        match &callee.kind {
            ValKind::Closure(closure) => match &closure.callable {
                Callable::Compiled { .. } => {
                    self.enter_closure(closure.clone(), Args::Regs { start, count }, dest, FrameKind::Call)
                }
                Callable::Native(f) => {
                    let result = self.call_native(*f, start, count)?;
                    self.set_reg(base + dest as usize, result);
                    Ok(())
                }
                Callable::Extension(f) => {
                    let result = f(&self.regs[start..start + count])?;
                    self.set_reg(base + dest as usize, result);
                    Ok(())
                }
            },
            ValKind::Array(candidates) => {
                let chosen = select_overload(candidates, &self.regs[start..start + count])?;
                self.dispatch_call(chosen, start, count, base, dest)
            }
            _ => bail!("attempt to call a non-function ({})", callee.type_name()),
        }
    }

    /// Native calls see a copy of their arguments in the reusable scratch
    /// buffer.
    fn call_native(&mut self, f: NativeFn, start: usize, count: usize) -> Result<Val> {
        let mut scratch = std::mem::take(&mut self.native_args);
        scratch.clear();
        scratch.extend_from_slice(&self.regs[start..start + count]);
        let result = f(&scratch, self);
        scratch.clear();
        self.native_args = scratch;
        result
    }

    /// Call any callable value and run it to completion.
    pub(crate) fn call_value(&mut self, callee: &Val, args: &[Val]) -> Result<Val> {
        match &callee.kind {
            ValKind::Closure(closure) => match &closure.callable {
                Callable::Compiled { .. } => {
                    self.enter_closure(closure.clone(), Args::Slice(args), 0, FrameKind::Entry)?;
                    let stop = self.frames.len() - 1;
                    self.run_frames(stop)
                }
                Callable::Native(f) => f(args, self),
                Callable::Extension(f) => f(args),
            },
            ValKind::Array(candidates) => {
                let chosen = select_overload(candidates, args)?;
                self.call_value(&chosen, args)
            }
            _ => bail!("attempt to call a non-function ({})", callee.type_name()),
        }
    }

    /// Finish the active frame with `value`.
    pub(super) fn return_value(&mut self, value: Val) -> Step {
        let Some(frame) = self.leave_frame(true) else {
            return Step::Done(value);
        };
        trace!(target: "lattice::vm::call", function = %frame.chunk.name, "call.return");
        match frame.kind {
            FrameKind::Call => {
                if let Some(caller) = self.frames.last() {
                    let abs = caller.base + frame.dest as usize;
                    self.set_reg(abs, value);
                }
                Step::Next
            }
            FrameKind::Entry | FrameKind::Module | FrameKind::Defer { .. } => Step::Done(value),
        }
    }

    /// `Closure` instruction followed by `captures` capture descriptors.
    pub(super) fn make_closure(&mut self, dst: Reg, proto: u16, captures: u16) -> Result<()> {
        let fi = self.frames.len() - 1;
        let (chunk, base, size) = {
            let frame = &self.frames[fi];
            (frame.chunk.clone(), frame.base, frame.size)
        };
        let Some(proto_chunk) = chunk.protos.get(proto as usize).cloned() else {
            bail!("function prototype {proto} out of range in '{}'", chunk.name);
        };
        let mut cells: Vec<UpvalueRef> = Vec::with_capacity(captures as usize);
        for _ in 0..captures {
            let ip = self.frames[fi].ip;
            let Some(Op::Capture(kind, index)) = chunk.code.get(ip).copied() else {
                bail!("closure '{}' is missing a capture descriptor", proto_chunk.name);
            };
            self.frames[fi].ip += 1;
            let index = index as usize;
            let cell = match kind {
                CaptureKind::Local => {
                    if index >= size {
                        bail!("capture of register {index} outside the window of '{}'", chunk.name);
                    }
                    self.capture_local(fi, base + index)
                }
                CaptureKind::Upvalue => match self.frames[fi].upvalues().get(index) {
                    Some(cell) => cell.clone(),
                    None => bail!("upvalue index {index} out of range"),
                },
                CaptureKind::Copy => {
                    if index >= size {
                        bail!("capture of register {index} outside the window of '{}'", chunk.name);
                    }
                    let cell = UpvalueCell::closed(self.regs[base + index].clone());
                    self.gc.track_upvalue(&cell);
                    cell
                }
            };
            cells.push(cell);
        }
        let closure = Closure::compiled(proto_chunk, cells);
        self.set_reg(base + dst as usize, Val::closure(closure));
        self.maybe_collect();
        Ok(())
    }

    /// Open upvalue for an absolute register slot, shared by every closure
    /// capturing the same slot.
    fn capture_local(&mut self, frame: usize, slot: usize) -> UpvalueRef {
        if let Some(cell) = self
            .open_upvalues
            .iter()
            .find(|cell| cell.location().is_some_and(|(_, s)| s == slot))
        {
            return cell.clone();
        }
        let cell = UpvalueCell::open(frame, slot);
        self.gc.track_upvalue(&cell);
        self.open_upvalues.push(cell.clone());
        cell
    }

    /// `CollectVarargs`: arguments from position `from` up to the first
    /// nil or unit.
    pub(super) fn collect_varargs(&self, base: usize, size: usize, from: u16) -> Val {
        let items = (1 + from as usize..size)
            .map(|slot| &self.regs[base + slot])
            .take_while(|v| !matches!(v.kind, ValKind::Nil | ValKind::Unit))
            .cloned()
            .collect();
        Val::array(items)
    }
}

/// Pick the overload whose parameter phase constraints best fit `args`.
/// Exact phase matches score 3, unconstrained parameters 2, anything else
/// admissible 1; the first candidate wins ties.
pub(crate) fn select_overload(candidates: &[Val], args: &[Val]) -> Result<Val> {
    if !candidates.iter().any(|c| c.as_closure().is_some()) {
        bail!("attempt to call a non-function (Array)");
    }
    let mut best: Option<(u32, &Val)> = None;
    for candidate in candidates {
        let Some(closure) = candidate.as_closure() else {
            continue;
        };
        let score = match &closure.callable {
            Callable::Compiled { chunk, .. } => match phase_score(chunk, args) {
                Some(score) => score,
                None => continue,
            },
            Callable::Native(_) | Callable::Extension(_) => 0,
        };
        if best.is_none_or(|(top, _)| score > top) {
            best = Some((score, candidate));
        }
    }
    best.map(|(_, v)| v.clone())
        .ok_or_else(|| anyhow!("no matching overload for given argument phases"))
}

fn phase_score(chunk: &Chunk, args: &[Val]) -> Option<u32> {
    let mut score = 0;
    for (constraint, arg) in chunk.param_phases.iter().zip(args) {
        let phase: Phase = arg.phase;
        if !constraint.admits(phase) {
            return None;
        }
        score += constraint.score(phase);
    }
    Some(score)
}
