use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use tracing::{debug, trace};

use crate::iter;
use crate::val::{CmpOp, Phase, Val, ValKind};
use crate::vm::alloc::EPHEMERAL_REGION;
use crate::vm::bytecode::{ConstIdx, Op, Reg};
use crate::vm::debug::{DebugAction, DebugView};
use crate::vm::error::fatal;
use crate::vm::frame::{DeferRecord, Handler};
use crate::vm::vm::{Fault, Vm};

use super::access::{get_field, get_index, length, new_buffer, new_map};

/// Outcome of one instruction.
pub(crate) enum Step {
    Next,
    /// The frame at the bottom of the current run returned.
    Done(Val),
}

#[inline]
fn offset_ip(ip: usize, offset: i32) -> usize {
    (ip as i64 + offset as i64).max(0) as usize
}

impl Vm {
    /// Execute until the frame at index `stop` finishes. On return the frame
    /// stack is back to `stop` frames.
    pub(super) fn run_frames(&mut self, stop: usize) -> Result<Val> {
        loop {
            if self.halted {
                self.abandon_frames(stop);
                return Ok(Val::nil());
            }
            match self.step() {
                Ok(Step::Next) => {}
                Ok(Step::Done(value)) => return Ok(value),
                Err(fault) => self.unwind(fault, stop)?,
            }
        }
    }

    /// Consult the debugger about the instruction at the current ip.
    fn consult_debugger(&mut self, fi: usize) -> bool {
        let Some(hook) = self.debug_hook.as_mut() else {
            return false;
        };
        let frame = &self.frames[fi];
        let Some(&op) = frame.chunk.code.get(frame.ip) else {
            return false;
        };
        let view = DebugView {
            frames: &self.frames,
            regs: &self.regs,
            globals: &self.rt.globals,
            op,
        };
        if hook.before_instruction(&view) == DebugAction::Halt {
            debug!(target: "lattice::vm::debug", line = view.line(), "debug.halt");
            self.halted = true;
            return true;
        }
        false
    }

    fn konst(&self, fi: usize, idx: ConstIdx) -> Result<Val> {
        let chunk = &self.frames[fi].chunk;
        chunk
            .consts
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| anyhow!("constant index {idx} out of range in '{}'", chunk.name))
    }

    pub(super) fn kstr(&self, fi: usize, idx: ConstIdx) -> Result<Arc<str>> {
        self.frames[fi].chunk.const_str(idx).cloned()
    }

    fn jump(&mut self, fi: usize, offset: i32) {
        let frame = &mut self.frames[fi];
        frame.ip = offset_ip(frame.ip, offset);
    }

    /// Append a history snapshot when a named, tracked local is written.
    pub(super) fn record_local(&mut self, fi: usize, r: Reg) {
        if !self.rt.tracking_active() {
            return;
        }
        let frame = &self.frames[fi];
        let Some(name) = frame.chunk.local_name(r as usize).cloned() else {
            return;
        };
        let value = self.regs[frame.base + r as usize].clone();
        let function = frame.chunk.name.clone();
        let line = frame.line();
        self.rt.record_history(&name, &value, line, Some(&function));
    }

    fn record_global(&mut self, name: &str) {
        if !self.rt.tracking_active() {
            return;
        }
        if let Some(value) = self.rt.globals.get(name).cloned() {
            let line = self.line();
            let function = self.frames.last().map(|f| f.chunk.name.clone());
            self.rt.record_history(name, &value, line, function.as_deref());
        }
    }

    fn arith(&mut self, base: usize, a: Reg, b: Reg, c: Reg, op: fn(&Val, &Val) -> Result<Val>) -> Result<()> {
        let value = op(self.reg(base, b), self.reg(base, c))?;
        self.set_reg(base + a as usize, value);
        Ok(())
    }

    fn cmp(&mut self, base: usize, a: Reg, b: Reg, c: Reg, op: CmpOp) -> Result<()> {
        let value = self.reg(base, b).compare(self.reg(base, c), op)?;
        self.set_reg(base + a as usize, Val::bool(value));
        Ok(())
    }

    /// Integer fast path; other operand kinds take the generic route.
    fn int_fast(
        &mut self,
        base: usize,
        (a, b, c): (Reg, Reg, Reg),
        fast: fn(i64, i64) -> Val,
        slow: fn(&Val, &Val) -> Result<Val>,
    ) -> Result<()> {
        let value = match (&self.reg(base, b).kind, &self.reg(base, c).kind) {
            (ValKind::Int(x), ValKind::Int(y)) => fast(*x, *y),
            _ => slow(self.reg(base, b), self.reg(base, c))?,
        };
        self.set_reg(base + a as usize, value);
        Ok(())
    }

    fn run_slice(&self, base: usize, start: Reg, count: u16) -> &[Val] {
        let start = base + start as usize;
        &self.regs[start..start + count as usize]
    }

    fn step(&mut self) -> Result<Step, Fault> {
        let Some(fi) = self.frames.len().checked_sub(1) else {
            return Ok(Step::Done(Val::nil()));
        };
        if self.debug_hook.is_some() && self.consult_debugger(fi) {
            return Ok(Step::Next);
        }
        let frame = &mut self.frames[fi];
        let Some(&op) = frame.chunk.code.get(frame.ip) else {
            return Ok(self.return_value(Val::nil()));
        };
        frame.ip += 1;
        let base = frame.base;

        match op {
            Op::Move(a, b) => {
                let value = self.reg(base, b).clone();
                self.set_reg(base + a as usize, value);
                self.record_local(fi, a);
            }
            Op::LoadK(a, k) => {
                let value = self.konst(fi, k)?;
                self.set_reg(base + a as usize, value);
                self.record_local(fi, a);
            }
            Op::LoadInt(a, v) => {
                self.set_reg(base + a as usize, Val::int(i64::from(v)));
                self.record_local(fi, a);
            }
            Op::LoadNil(a) => self.set_reg(base + a as usize, Val::nil()),
            Op::LoadTrue(a) => {
                self.set_reg(base + a as usize, Val::bool(true));
                self.record_local(fi, a);
            }
            Op::LoadFalse(a) => {
                self.set_reg(base + a as usize, Val::bool(false));
                self.record_local(fi, a);
            }
            Op::LoadUnit(a) => self.set_reg(base + a as usize, Val::unit()),

            Op::Add(a, b, c) => self.arith(base, a, b, c, |x, y| x + y)?,
            Op::Sub(a, b, c) => self.arith(base, a, b, c, |x, y| x - y)?,
            Op::Mul(a, b, c) => self.arith(base, a, b, c, |x, y| x * y)?,
            Op::Div(a, b, c) => self.arith(base, a, b, c, |x, y| x / y)?,
            Op::Mod(a, b, c) => self.arith(base, a, b, c, |x, y| x % y)?,
            Op::Neg(a, b) => {
                let value = (-self.reg(base, b))?;
                self.set_reg(base + a as usize, value);
            }
            Op::AddImm(a, b, imm) => {
                let value = match self.reg(base, b).kind {
                    ValKind::Int(x) => Val::int(x.wrapping_add(i64::from(imm))),
                    _ => (self.reg(base, b) + &Val::int(i64::from(imm)))?,
                };
                self.set_reg(base + a as usize, value);
            }
            Op::Concat(a, b, c) => {
                let value = self.reg(base, b).concat(self.reg(base, c));
                let value = self.regions.place(EPHEMERAL_REGION, value);
                self.set_reg(base + a as usize, value);
            }

            Op::AddInt(a, b, c) => self.int_fast(base, (a, b, c), |x, y| Val::int(x.wrapping_add(y)), |x, y| x + y)?,
            Op::SubInt(a, b, c) => self.int_fast(base, (a, b, c), |x, y| Val::int(x.wrapping_sub(y)), |x, y| x - y)?,
            Op::MulInt(a, b, c) => self.int_fast(base, (a, b, c), |x, y| Val::int(x.wrapping_mul(y)), |x, y| x * y)?,
            Op::LtInt(a, b, c) => self.int_fast(base, (a, b, c), |x, y| Val::bool(x < y), |x, y| {
                x.compare(y, CmpOp::Lt).map(Val::bool)
            })?,
            Op::LtEqInt(a, b, c) => self.int_fast(base, (a, b, c), |x, y| Val::bool(x <= y), |x, y| {
                x.compare(y, CmpOp::LtEq).map(Val::bool)
            })?,
            Op::IncReg(a) | Op::DecReg(a) => {
                let delta = if matches!(op, Op::IncReg(_)) { 1 } else { -1 };
                let value = match self.reg(base, a).kind {
                    ValKind::Int(x) => Val::int(x.wrapping_add(delta)),
                    _ => (self.reg(base, a) + &Val::int(delta))?,
                };
                self.set_reg(base + a as usize, value);
                self.record_local(fi, a);
            }

            Op::Eq(a, b, c) => {
                let value = self.reg(base, b).equals(self.reg(base, c));
                self.set_reg(base + a as usize, Val::bool(value));
            }
            Op::NotEq(a, b, c) => {
                let value = !self.reg(base, b).equals(self.reg(base, c));
                self.set_reg(base + a as usize, Val::bool(value));
            }
            Op::Lt(a, b, c) => self.cmp(base, a, b, c, CmpOp::Lt)?,
            Op::LtEq(a, b, c) => self.cmp(base, a, b, c, CmpOp::LtEq)?,
            Op::Gt(a, b, c) => self.cmp(base, a, b, c, CmpOp::Gt)?,
            Op::GtEq(a, b, c) => self.cmp(base, a, b, c, CmpOp::GtEq)?,
            Op::Not(a, b) => {
                let value = !self.reg(base, b).is_truthy();
                self.set_reg(base + a as usize, Val::bool(value));
            }

            Op::BitAnd(a, b, c) => self.arith(base, a, b, c, Val::bit_and)?,
            Op::BitOr(a, b, c) => self.arith(base, a, b, c, Val::bit_or)?,
            Op::BitXor(a, b, c) => self.arith(base, a, b, c, Val::bit_xor)?,
            Op::Shl(a, b, c) => self.arith(base, a, b, c, Val::shl)?,
            Op::Shr(a, b, c) => self.arith(base, a, b, c, Val::shr)?,
            Op::BitNot(a, b) => {
                let value = self.reg(base, b).bit_not()?;
                self.set_reg(base + a as usize, value);
            }

            Op::Jmp(offset) => self.jump(fi, offset),
            Op::JmpFalse(r, offset) => {
                if !self.reg(base, r).is_truthy() {
                    self.jump(fi, offset);
                }
            }
            Op::JmpTrue(r, offset) => {
                if self.reg(base, r).is_truthy() {
                    self.jump(fi, offset);
                }
            }
            Op::JmpNotNil(r, offset) => {
                if !self.reg(base, r).is_nil() {
                    self.jump(fi, offset);
                }
            }

            Op::DefineGlobal(r, k) => {
                let name = self.kstr(fi, k)?;
                let value = self.reg(base, r).clone();
                self.rt.globals.insert(name.clone(), value);
                if let Some(defs) = self.module_defs.last_mut() {
                    defs.push(name.clone());
                }
                self.record_global(&name);
            }
            Op::GetGlobal(r, k) => {
                let name = self.kstr(fi, k)?;
                let Some(value) = self.rt.globals.get(&name).cloned() else {
                    return Err(anyhow!("undefined variable '{name}'").into());
                };
                self.set_reg(base + r as usize, value);
            }
            Op::SetGlobal(r, k) => {
                let name = self.kstr(fi, k)?;
                if !self.rt.globals.contains_key(&name) {
                    return Err(anyhow!("undefined variable '{name}'").into());
                }
                let value = self.reg(base, r).clone();
                self.rt.globals.insert(name.clone(), value);
                self.record_global(&name);
            }

            Op::GetUpvalue(r, idx) => {
                let Some(cell) = self.frames[fi].upvalues().get(idx as usize).cloned() else {
                    return Err(anyhow!("upvalue index {idx} out of range").into());
                };
                let value = self.upvalue_value(&cell);
                self.set_reg(base + r as usize, value);
            }
            Op::SetUpvalue(r, idx) => {
                let Some(cell) = self.frames[fi].upvalues().get(idx as usize).cloned() else {
                    return Err(anyhow!("upvalue index {idx} out of range").into());
                };
                let value = self.reg(base, r).clone();
                self.write_upvalue(&cell, value);
            }
            Op::CloseUpvalue(r) => self.close_upvalues(base + r as usize),

            Op::GetField(a, b, k) => {
                let name = self.kstr(fi, k)?;
                let value = get_field(self.reg(base, b), &name)?;
                self.set_reg(base + a as usize, value);
            }
            Op::SetField(obj, k, v) => {
                let name = self.kstr(fi, k)?;
                let value = self.reg(base, v).clone();
                self.set_field(base + obj as usize, &name, value)?;
                self.record_local(fi, obj);
            }
            Op::GetIndex(a, b, c) => {
                let value = get_index(self.reg(base, b), self.reg(base, c))?;
                self.set_reg(base + a as usize, value);
            }
            Op::SetIndex(obj, idx, v) => {
                let index = self.reg(base, idx).clone();
                let value = self.reg(base, v).clone();
                self.set_index(fi, base + obj as usize, &index, value)?;
                self.record_local(fi, obj);
            }
            Op::Len(a, b) => {
                let value = length(self.reg(base, b))?;
                self.set_reg(base + a as usize, value);
            }

            Op::Call { func, argc } => self.op_call(base, func, argc)?,
            Op::Return(r) => {
                let value = self.reg(base, r).clone();
                return Ok(self.return_value(value));
            }
            Op::Closure { dst, proto, captures } => self.make_closure(dst, proto, captures)?,
            Op::Capture(..) => return Err(anyhow!("capture descriptor outside a closure instruction").into()),

            Op::NewArray { dst, base: start, count } => {
                let items = self.run_slice(base, start, count).to_vec();
                self.set_reg(base + dst as usize, Val::array(items));
            }
            Op::NewTuple { dst, base: start, count } => {
                let items = self.run_slice(base, start, count).to_vec();
                self.set_reg(base + dst as usize, Val::tuple(items));
            }
            Op::NewMap { dst, base: start, count } => {
                let value = new_map(self.run_slice(base, start, count.saturating_mul(2)))?;
                self.set_reg(base + dst as usize, value);
            }
            Op::NewSet { dst, base: start, count } => {
                let items = self.run_slice(base, start, count).to_vec();
                self.set_reg(base + dst as usize, Val::set(items));
            }
            Op::NewStruct { dst, name, base: start, count } => {
                let name = self.kstr(fi, name)?;
                let value = self.new_struct(&name, self.run_slice(base, start, count))?;
                self.set_reg(base + dst as usize, value);
            }
            Op::NewEnum {
                dst,
                name,
                variant,
                base: start,
                count,
            } => {
                let enum_name = self.kstr(fi, name)?;
                let variant = self.kstr(fi, variant)?;
                let payload = self.run_slice(base, start, count).to_vec();
                self.set_reg(base + dst as usize, Val::enumeration(enum_name, variant, payload));
            }
            Op::BuildRange(a, b, c) => {
                let (ValKind::Int(start), ValKind::Int(end)) = (&self.reg(base, b).kind, &self.reg(base, c).kind) else {
                    return Err(anyhow!("range bounds must be integers").into());
                };
                let value = Val::range(*start, *end);
                self.set_reg(base + a as usize, value);
            }
            Op::NewRef(a, b) => {
                let value = Val::new_ref(self.reg(base, b).clone());
                if let ValKind::Ref(cell) = &value.kind {
                    self.gc.track_ref(cell);
                }
                self.set_reg(base + a as usize, value);
                self.maybe_collect();
            }
            Op::NewBuffer(a, b) => {
                let value = new_buffer(self.reg(base, b))?;
                self.set_reg(base + a as usize, value);
            }

            Op::Invoke {
                dst,
                obj,
                method,
                base: start,
                argc,
            } => {
                let method = self.kstr(fi, method)?;
                self.invoke(fi, dst, obj, &method, start, argc)?;
            }

            Op::IterInit(a, b) => {
                let it = iter::from_value(self.reg(base, b))?;
                self.set_reg(base + a as usize, Val::iterator(it));
            }
            Op::IterNext { dst, iter, offset } => {
                let it = match &self.reg(base, iter).kind {
                    ValKind::Iterator(it) => it.clone(),
                    _ => {
                        let found = self.reg(base, iter).type_name();
                        return Err(anyhow!("IterNext on non-iterator ({found})").into());
                    }
                };
                match it.next(self)? {
                    Some(item) => {
                        self.set_reg(base + dst as usize, item);
                        self.record_local(fi, dst);
                    }
                    None => self.jump(fi, offset),
                }
            }

            Op::Freeze(a, b) => {
                let mut value = self.reg(base, b).clone();
                if matches!(value.kind, ValKind::Channel(_)) {
                    return Err(anyhow!("cannot freeze a channel").into());
                }
                value.freeze();
                self.set_reg(base + a as usize, value);
                self.record_local(fi, a);
            }
            Op::Thaw(a, b) => {
                let value = self.reg(base, b).thawed();
                self.set_reg(base + a as usize, value);
                self.record_local(fi, a);
            }
            Op::Clone(a, b) => {
                let value = self.reg(base, b).clone();
                self.set_reg(base + a as usize, value);
            }
            Op::MarkFluid(a) => {
                self.regs[base + a as usize].phase = Phase::Fluid;
                self.record_local(fi, a);
            }
            Op::IsCrystal(a, b) => {
                let value = self.reg(base, b).phase == Phase::Crystal;
                self.set_reg(base + a as usize, Val::bool(value));
            }
            Op::IsFluid(a, b) => {
                let value = self.reg(base, b).phase == Phase::Fluid;
                self.set_reg(base + a as usize, Val::bool(value));
            }

            Op::PushHandler { reg, offset } => {
                if self.handlers.len() >= self.limits.handlers {
                    return Err(self.fatal(fatal::HANDLER_STACK).into());
                }
                let resume_ip = offset_ip(self.frames[fi].ip, offset);
                self.handlers.push(Handler {
                    frame: fi,
                    reg_top: self.regs.len(),
                    resume_ip,
                    reg,
                });
            }
            Op::PopHandler => {
                if self.handlers.last().is_some_and(|h| h.frame == fi) {
                    self.handlers.pop();
                }
            }
            Op::Throw(r) => return Err(Fault::Throw(self.reg(base, r).clone())),
            Op::TryUnwrap(r) => {
                let value = self.reg(base, r).clone();
                match unwrap_result(&value)? {
                    Ok(inner) => self.set_reg(base + r as usize, inner),
                    Err(()) => return Ok(self.return_value(value)),
                }
            }

            Op::DeferPush { depth, offset } => {
                if self.defers.len() >= self.limits.defers {
                    return Err(self.fatal(fatal::DEFER_STACK).into());
                }
                let frame = &self.frames[fi];
                let record = DeferRecord {
                    frame: fi,
                    depth,
                    body_ip: frame.ip,
                    chunk: frame.chunk.clone(),
                };
                self.defers.push(record);
                self.jump(fi, offset);
            }
            Op::DeferRun(min_depth) => self.run_frame_defers(fi, min_depth),
            Op::DeferEnd => {
                self.finish_defer()?;
                return Ok(Step::Done(Val::nil()));
            }

            Op::CollectVarargs { dst, from } => {
                let size = self.frames[fi].size;
                let value = self.collect_varargs(base, size, from);
                self.set_reg(base + dst as usize, value);
            }

            Op::FreezeVar {
                name,
                loc,
                slot,
                consume_seeds,
            } => self.freeze_var(fi, name, loc, slot, consume_seeds)?,
            Op::ThawVar { name, loc, slot } => self.thaw_var(fi, name, loc, slot)?,
            Op::SublimateVar { name, loc, slot } => self.sublimate_var(fi, name, loc, slot)?,
            Op::React { name, callback } => self.react(base, name, callback)?,
            Op::Unreact(name) => self.unreact(base, name)?,
            Op::Bond { target, dep, strategy } => self.bond(fi, target, dep, strategy)?,
            Op::Unbond { target, dep } => self.unbond(fi, target, dep)?,
            Op::Seed { name, contract } => self.seed(base, name, contract)?,
            Op::Unseed(name) => self.unseed(base, name)?,

            Op::Import(r, k) => {
                let path = self.kstr(fi, k)?;
                let namespace = self.import_module(&path)?;
                self.set_reg(base + r as usize, namespace);
            }
            Op::Scope { dst, base: start, spawns } => {
                let value = self.run_scope(base, start, spawns)?;
                self.set_reg(base + dst as usize, value);
            }
            Op::Select { dst, base: start, arms } => {
                let value = self.run_select(base, start, arms)?;
                self.set_reg(base + dst as usize, value);
            }
            Op::ResetEphemeral => {
                let dropped = self.regions.reset(EPHEMERAL_REGION);
                if dropped > 0 {
                    trace!(target: "lattice::vm::alloc", dropped, "region.reset");
                }
            }
            Op::Print { base: start, count } => {
                let line = self
                    .run_slice(base, start, count)
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.write_output(&line)?;
            }
            Op::Halt => {
                debug!(target: "lattice::vm::debug", line = self.line(), "vm.halt");
                self.halted = true;
            }
        }
        Ok(Step::Next)
    }
}

/// `Ok(inner)` for an ok result, `Err(())` for an error result.
fn unwrap_result(value: &Val) -> Result<Result<Val, ()>> {
    match &value.kind {
        ValKind::Map(map) => {
            let tag = map.get("tag").and_then(Val::as_str);
            match tag {
                Some("ok") => Ok(Ok(map.get("value").cloned().unwrap_or_else(Val::nil))),
                Some("err") => Ok(Err(())),
                _ => bail!("'?' operator requires a Result value, got Map"),
            }
        }
        ValKind::Enum(e) => match e.variant.as_ref() {
            "Ok" => Ok(Ok(e.payload.first().cloned().unwrap_or_else(Val::unit))),
            "Err" => Ok(Err(())),
            _ => bail!("'?' operator requires a Result value, got Enum"),
        },
        _ => bail!("'?' operator requires a Result value, got {}", value.type_name()),
    }
}
