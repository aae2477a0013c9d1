//! Debugger attachment point.
//!
//! A [`DebugHook`] installed on the engine is consulted before every
//! instruction. It sees a read-only [`DebugView`] of the machine and may stop
//! the run. Breakpoint bookkeeping and any wire protocol belong to the host.

use std::sync::Arc;

use crate::util::lat_map::LatMap;
use crate::val::Val;

use super::bytecode::Op;
use super::frame::CallFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugAction {
    Continue,
    /// Stop the run; it finishes with a halt result (`nil`).
    Halt,
}

pub trait DebugHook: Send {
    fn before_instruction(&mut self, view: &DebugView<'_>) -> DebugAction;
}

/// Frame summary exposed to debuggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSummary {
    pub function: Arc<str>,
    pub line: u32,
    pub ip: usize,
}

pub struct DebugView<'a> {
    pub(crate) frames: &'a [CallFrame],
    pub(crate) regs: &'a [Val],
    pub(crate) globals: &'a LatMap<Val>,
    pub(crate) op: Op,
}

impl<'a> DebugView<'a> {
    fn top(&self) -> Option<&'a CallFrame> {
        self.frames.last()
    }

    /// Line of the instruction about to execute.
    pub fn line(&self) -> u32 {
        self.top().map(|f| f.chunk.line_at(f.ip)).unwrap_or(0)
    }

    pub fn ip(&self) -> usize {
        self.top().map(|f| f.ip).unwrap_or(0)
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn function(&self) -> &str {
        self.top().map(|f| f.chunk.name.as_ref()).unwrap_or("")
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Named locals of the active frame, in slot order.
    pub fn locals(&self) -> Vec<(Arc<str>, Val)> {
        let Some(frame) = self.top() else {
            return Vec::new();
        };
        frame
            .chunk
            .local_names
            .iter()
            .enumerate()
            .filter_map(|(slot, name)| {
                let name = name.as_ref()?;
                let value = self.regs.get(frame.base + slot)?;
                Some((name.clone(), value.clone()))
            })
            .collect()
    }

    pub fn global(&self, name: &str) -> Option<&Val> {
        self.globals.get(name)
    }

    pub fn globals(&self) -> &LatMap<Val> {
        self.globals
    }

    /// Innermost frame first.
    pub fn backtrace(&self) -> Vec<FrameSummary> {
        self.frames
            .iter()
            .rev()
            .map(|f| FrameSummary {
                function: f.chunk.name.clone(),
                line: f.chunk.line_at(f.ip),
                ip: f.ip,
            })
            .collect()
    }
}
