mod access;
mod call;
mod concurrency;
mod exec;
mod host;
mod import;
mod invoke;
mod phase;
mod unwind;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};

use crate::config::{Limits, VmConfig};
use crate::gc::Gc;
use crate::module::ModuleRegistry;
use crate::rt::{Runtime, Scheduler};
use crate::util::lat_map::LatMap;
use crate::val::{Val, ValKind};
use crate::vm::alloc::RegionAllocator;
use crate::vm::artifact::Artifact;
use crate::vm::bytecode::{Chunk, Reg};
use crate::vm::debug::DebugHook;
use crate::vm::frame::{CallFrame, DeferRecord, FrameKind, Handler};
use crate::vm::upvalue::{Upvalue, UpvalueRef};

pub(crate) use unwind::Fault;

/// Register-windowed bytecode engine.
///
/// One engine owns one register file, frame stack and runtime state; it is
/// never shared between threads. Concurrency works by forking: each spawned
/// task runs on its own [`Vm::fork`].
pub struct Vm {
    regs: Vec<Val>,
    frames: Vec<CallFrame>,
    handlers: Vec<Handler>,
    defers: Vec<DeferRecord>,
    /// Upvalue cells still aliasing a register, in creation order.
    open_upvalues: Vec<UpvalueRef>,
    rt: Runtime,
    gc: Gc,
    regions: RegionAllocator,
    /// Reused argument buffer for native calls.
    native_args: Vec<Val>,
    debug_hook: Option<Box<dyn DebugHook>>,
    limits: Limits,
    /// Artifact whose bundled modules satisfy imports first.
    bundle: Option<Arc<Artifact>>,
    /// Dedicated scheduler; the shared one when `None`.
    scheduler: Option<Arc<Scheduler>>,
    output: Option<Box<dyn Write + Send>>,
    halted: bool,
    /// Globals defined by each module currently being imported.
    module_defs: Vec<Vec<Arc<str>>>,
}

impl Vm {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self::with_config(registry, &VmConfig::default())
    }

    pub fn with_config(registry: Arc<ModuleRegistry>, config: &VmConfig) -> Self {
        let mut rt = Runtime::new(registry);
        rt.script_dir = config.script_dir.clone();
        rt.track_all = config.track_all;
        let scheduler = config.single_thread.then(|| Arc::new(Scheduler::new_current_thread()));
        Self::from_parts(rt, Gc::new(config.gc.clone()), config.limits, scheduler)
    }

    fn from_parts(rt: Runtime, gc: Gc, limits: Limits, scheduler: Option<Arc<Scheduler>>) -> Self {
        Self {
            regs: Vec::with_capacity(limits.registers_per_window),
            frames: Vec::with_capacity(limits.frames),
            handlers: Vec::new(),
            defers: Vec::new(),
            open_upvalues: Vec::new(),
            rt,
            gc,
            regions: RegionAllocator::new(),
            native_args: Vec::with_capacity(crate::vm::NATIVE_ARG_SCRATCH),
            debug_hook: None,
            limits,
            bundle: None,
            scheduler,
            output: None,
            halted: false,
            module_defs: Vec::new(),
        }
    }

    /// Execute `chunk` as a top-level program and return its result.
    /// A run stopped by the debugger yields `nil`.
    pub fn run(&mut self, chunk: Arc<Chunk>) -> Result<Val> {
        verify_chunk(&chunk, self.limits.registers_per_window)?;
        if self.frames.is_empty() {
            self.halted = false;
        }
        self.declare_structs(&chunk);
        self.run_chunk(chunk, FrameKind::Entry)
    }

    /// Execute an artifact's entry chunk; its bundled modules become
    /// importable for the rest of this engine's life.
    pub fn run_artifact(&mut self, artifact: Artifact) -> Result<Val> {
        let artifact = Arc::new(artifact);
        let entry = Arc::new(artifact.entry.clone());
        self.bundle = Some(artifact);
        self.run(entry)
    }

    /// Call any callable value from host code.
    pub fn call(&mut self, callee: &Val, args: &[Val]) -> Result<Val> {
        self.call_value(callee, args)
    }

    /// Engine for a concurrent task: globals are copied with every closure
    /// detached from this engine's frames; struct metadata and the module
    /// registry are shared.
    pub fn fork(&self) -> Vm {
        let mut globals = LatMap::with_capacity(self.rt.globals.len());
        for (name, value) in self.rt.globals.iter() {
            globals.insert(name.clone(), self.detach_value(value));
        }
        let mut child = Vm::from_parts(
            self.rt.fork(globals),
            Gc::new(self.gc.config().clone()),
            self.limits,
            self.scheduler.clone(),
        );
        child.bundle = self.bundle.clone();
        child
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn runtime_mut(&mut self) -> &mut Runtime {
        &mut self.rt
    }

    pub fn gc(&self) -> &Gc {
        &self.gc
    }

    pub fn gc_mut(&mut self) -> &mut Gc {
        &mut self.gc
    }

    pub fn regions(&self) -> &RegionAllocator {
        &self.regions
    }

    pub fn regions_mut(&mut self) -> &mut RegionAllocator {
        &mut self.regions
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn global(&self, name: &str) -> Option<&Val> {
        self.rt.globals.get(name)
    }

    pub fn set_global(&mut self, name: &str, value: Val) {
        self.rt.globals.insert(name, value);
    }

    pub fn set_debug_hook(&mut self, hook: Box<dyn DebugHook>) {
        self.debug_hook = Some(hook);
    }

    pub fn clear_debug_hook(&mut self) -> Option<Box<dyn DebugHook>> {
        self.debug_hook.take()
    }

    /// Redirect `print` output (stdout by default).
    pub fn set_output(&mut self, output: Box<dyn Write + Send>) {
        self.output = Some(output);
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn handler_depth(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Run a full collection now, regardless of thresholds.
    pub fn collect_garbage(&mut self) -> usize {
        let mut gc = std::mem::take(&mut self.gc);
        let freed = gc.collect(self);
        self.gc = gc;
        freed
    }

    pub(crate) fn maybe_collect(&mut self) {
        if self.gc.should_collect() {
            self.collect_garbage();
        }
    }

    fn declare_structs(&mut self, chunk: &Chunk) {
        for decl in &chunk.structs {
            self.rt.define_struct(decl.name.clone(), decl.fields.clone());
        }
    }

    /// Push a frame for `chunk` and run it to completion.
    fn run_chunk(&mut self, chunk: Arc<Chunk>, kind: FrameKind) -> Result<Val> {
        self.push_frame(chunk, None, 0, kind)?;
        let stop = self.frames.len() - 1;
        self.run_frames(stop)
    }

    #[inline]
    pub(crate) fn current_frame(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    pub(crate) fn line(&self) -> u32 {
        self.frames.last().map_or(0, CallFrame::line)
    }

    #[inline]
    fn reg(&self, base: usize, r: Reg) -> &Val {
        &self.regs[base + r as usize]
    }

    /// Overwrite a register. Arena-owned old values are parked in their
    /// region instead of being dropped here.
    #[inline]
    fn set_reg(&mut self, abs: usize, value: Val) {
        let old = std::mem::replace(&mut self.regs[abs], value);
        if !old.region.is_owned() {
            self.regions.release(old);
        }
    }

    /// Shrink the register file to `top`, releasing everything above it.
    fn release_window(&mut self, top: usize) {
        if self.regs.len() <= top {
            return;
        }
        for value in self.regs.drain(top..) {
            self.regions.release(value);
        }
    }

    /// Current value behind an upvalue cell.
    fn upvalue_value(&self, cell: &UpvalueRef) -> Val {
        match &*cell.state() {
            Upvalue::Open { slot, .. } => self.regs.get(*slot).cloned().unwrap_or_else(Val::nil),
            Upvalue::Closed(v) => v.clone(),
        }
    }

    fn write_upvalue(&mut self, cell: &UpvalueRef, value: Val) {
        let slot = {
            let mut state = cell.state();
            match &mut *state {
                Upvalue::Open { slot, .. } => *slot,
                Upvalue::Closed(v) => {
                    *v = value;
                    return;
                }
            }
        };
        if slot < self.regs.len() {
            self.set_reg(slot, value);
        }
    }

    /// Close every open upvalue aliasing a register at or above `from`.
    fn close_upvalues(&mut self, from: usize) {
        let regs = &self.regs;
        self.open_upvalues.retain(|cell| match cell.location() {
            Some((_, slot)) if slot >= from => {
                cell.close(regs.get(slot).cloned().unwrap_or_else(Val::nil));
                false
            }
            Some(_) => true,
            None => false,
        });
    }

    /// Copy of `value` that shares no open upvalue with this engine.
    pub(crate) fn detach_value(&self, value: &Val) -> Val {
        let resolve = |_frame: usize, slot: usize| self.regs.get(slot).cloned().unwrap_or_else(Val::nil);
        let mut out = value.clone();
        detach_in_place(&mut out, &resolve);
        out
    }

    pub(crate) fn scheduler(&self) -> Arc<Scheduler> {
        match &self.scheduler {
            Some(s) => s.clone(),
            None => crate::rt::scheduler(),
        }
    }

    fn write_output(&mut self, line: &str) -> Result<()> {
        match self.output.as_mut() {
            Some(out) => writeln!(out, "{line}")?,
            None => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                writeln!(lock, "{line}")?;
            }
        }
        Ok(())
    }
}

fn detach_in_place(value: &mut Val, resolve: &dyn Fn(usize, usize) -> Val) {
    match &mut value.kind {
        ValKind::Closure(closure) => {
            if closure.upvalues().iter().any(|cell| cell.is_open()) {
                let detached = closure.detached(resolve);
                *closure = Arc::new(detached);
            }
        }
        ValKind::Array(items) | ValKind::Tuple(items) => items.iter_mut().for_each(|v| detach_in_place(v, resolve)),
        ValKind::Struct(s) => s.fields.iter_mut().for_each(|(_, v)| detach_in_place(v, resolve)),
        ValKind::Enum(e) => e.payload.iter_mut().for_each(|v| detach_in_place(v, resolve)),
        ValKind::Map(m) | ValKind::Set(m) => m.values_mut().for_each(|v| detach_in_place(v, resolve)),
        _ => {}
    }
}

/// Reject chunks whose instructions reach past their declared window.
pub(crate) fn verify_chunk(chunk: &Chunk, window: usize) -> Result<()> {
    if chunk.max_regs as usize > window {
        bail!("'{}' needs {} registers (limit {})", chunk.name, chunk.max_regs, window);
    }
    if chunk.lines.len() != chunk.code.len() {
        bail!("'{}' has {} line entries for {} instructions", chunk.name, chunk.lines.len(), chunk.code.len());
    }
    for (ip, op) in chunk.code.iter().enumerate() {
        let extent = op.register_extent();
        if extent > chunk.max_regs.max(chunk.arity + 1) {
            return Err(anyhow!(
                "'{}' instruction {ip} ({op:?}) uses register {} beyond its window of {}",
                chunk.name,
                extent - 1,
                chunk.max_regs
            ));
        }
    }
    chunk.protos.iter().try_for_each(|proto| verify_chunk(proto, window))
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(Arc::new(ModuleRegistry::new()))
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("frames", &self.frames.len())
            .field("registers", &self.regs.len())
            .field("handlers", &self.handlers.len())
            .field("defers", &self.defers.len())
            .field("gc", &self.gc)
            .finish()
    }
}
