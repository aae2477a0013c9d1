use std::sync::Arc;

use crate::val::Closure;

use super::bytecode::{Chunk, Reg};
use super::upvalue::UpvalueRef;

pub const MAX_FRAMES: usize = 64;
pub const REGS_PER_WINDOW: usize = 256;
pub const MAX_REGISTERS: usize = MAX_FRAMES * REGS_PER_WINDOW;
pub const MAX_HANDLERS: usize = 64;
pub const MAX_DEFERS: usize = 256;
/// Capacity of the reusable argument buffer for native calls.
pub const NATIVE_ARG_SCRATCH: usize = 16;

/// Why a frame was pushed; decides what happens when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Ordinary call; the result goes to `dest` in the caller's window.
    Call,
    /// Outermost frame of a run started by the host (`run`, `call_closure`).
    Entry,
    /// Body of an imported module.
    Module,
    /// Deferred block executing on a copy of `owner`'s registers.
    Defer { owner: usize },
}

#[derive(Debug, Clone)]
pub struct CallFrame {
    pub chunk: Arc<Chunk>,
    pub ip: usize,
    /// Start of this frame's window in the register file.
    pub base: usize,
    pub size: usize,
    /// Closure being executed; `None` for entry, module and bare chunks.
    pub closure: Option<Arc<Closure>>,
    /// Register in the caller's window receiving the result.
    pub dest: Reg,
    pub kind: FrameKind,
}

impl CallFrame {
    #[inline]
    pub fn reg(&self, r: Reg) -> usize {
        self.base + r as usize
    }

    pub fn upvalues(&self) -> &[UpvalueRef] {
        self.closure.as_deref().map(Closure::upvalues).unwrap_or(&[])
    }

    pub fn line(&self) -> u32 {
        // ip has already advanced past the executing instruction
        self.chunk.line_at(self.ip.saturating_sub(1))
    }
}

/// Registered exception handler.
#[derive(Debug, Clone, Copy)]
pub struct Handler {
    pub frame: usize,
    /// Register-file length when the handler was pushed.
    pub reg_top: usize,
    pub resume_ip: usize,
    pub reg: Reg,
}

/// Pending deferred block.
#[derive(Debug, Clone)]
pub struct DeferRecord {
    pub frame: usize,
    pub depth: u8,
    pub body_ip: usize,
    pub chunk: Arc<Chunk>,
}
