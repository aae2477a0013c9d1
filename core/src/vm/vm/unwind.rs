use anyhow::Result;
use tracing::{debug, warn};

use crate::val::Val;
use crate::vm::error::RuntimeError;
use crate::vm::frame::{CallFrame, DeferRecord, FrameKind};
use crate::vm::vm::Vm;

/// Why an instruction stopped the current frame.
#[derive(Debug)]
pub(crate) enum Fault {
    /// Engine or native error.
    Error(anyhow::Error),
    /// Script-level `throw` of a value.
    Throw(Val),
}

impl From<anyhow::Error> for Fault {
    fn from(err: anyhow::Error) -> Self {
        Fault::Error(err)
    }
}

impl Vm {
    /// Route a fault to the innermost handler registered at or above frame
    /// `stop`. Without one, unwinds down to `stop` and returns the error with
    /// a stack trace attached.
    pub(super) fn unwind(&mut self, fault: Fault, stop: usize) -> Result<()> {
        let (mut error, payload) = match fault {
            Fault::Throw(value) => (RuntimeError::thrown(value.clone(), self.line()), value),
            Fault::Error(err) => {
                let error = match err.downcast::<RuntimeError>() {
                    Ok(error) => error,
                    Err(err) => RuntimeError::new(format!("{err:#}"), self.line()),
                };
                let payload = match &error.thrown {
                    Some(value) => value.clone(),
                    None => Val::str(error.message.as_str()),
                };
                (error, payload)
            }
        };

        if !error.is_fatal() {
            if let Some(handler) = self.handlers.last().copied().filter(|h| h.frame >= stop) {
                self.handlers.pop();
                while self.frames.len() > handler.frame + 1 {
                    self.leave_frame(true);
                }
                self.release_window(handler.reg_top);
                let frame = &mut self.frames[handler.frame];
                frame.ip = handler.resume_ip;
                let abs = frame.base + handler.reg as usize;
                debug!(
                    target: "lattice::vm::unwind",
                    function = %frame.chunk.name,
                    message = %error.message,
                    "unwind.caught"
                );
                self.set_reg(abs, payload);
                return Ok(());
            }
        }

        for frame in self.frames[stop..].iter().rev() {
            error.trace.push((frame.chunk.name.clone(), frame.line()));
        }
        let run_defers = !error.is_fatal();
        while self.frames.len() > stop {
            self.leave_frame(run_defers);
        }
        debug!(
            target: "lattice::vm::unwind",
            message = %error.message,
            fatal = error.is_fatal(),
            depth = self.frames.len(),
            "unwind.uncaught"
        );
        Err(error.into())
    }

    /// Pop the active frame, running its pending defers first when asked.
    pub(super) fn leave_frame(&mut self, run_defers: bool) -> Option<CallFrame> {
        let idx = self.frames.len().checked_sub(1)?;
        if run_defers {
            self.run_frame_defers(idx, 0);
        }
        while self.defers.last().is_some_and(|d| d.frame >= idx) {
            self.defers.pop();
        }
        while self.handlers.last().is_some_and(|h| h.frame >= idx) {
            self.handlers.pop();
        }
        let frame = self.frames.pop()?;
        self.close_upvalues(frame.base);
        self.release_window(frame.base);
        Some(frame)
    }

    /// Drop frames down to `stop` without running defers (debugger halt).
    pub(super) fn abandon_frames(&mut self, stop: usize) {
        while self.frames.len() > stop {
            self.leave_frame(false);
        }
    }

    /// Run the defers of frame `idx` with scope depth `>= min_depth`, most
    /// recent first.
    pub(super) fn run_frame_defers(&mut self, idx: usize, min_depth: u8) {
        while let Some(pos) = self
            .defers
            .iter()
            .rposition(|d| d.frame == idx && d.depth >= min_depth)
        {
            let record = self.defers.remove(pos);
            self.run_defer(idx, record);
        }
    }

    /// Execute one deferred body on a copy of its owner's registers. Errors
    /// inside the body are logged and dropped.
    fn run_defer(&mut self, owner: usize, record: DeferRecord) {
        let (owner_base, owner_size, closure) = {
            let frame = &self.frames[owner];
            (frame.base, frame.size, frame.closure.clone())
        };
        if let Err(err) = self.push_frame(record.chunk, closure, 0, FrameKind::Defer { owner }) {
            warn!(target: "lattice::vm::unwind", error = %err, "defer.skipped");
            return;
        }
        let fi = self.frames.len() - 1;
        let (base, size) = (self.frames[fi].base, self.frames[fi].size);
        for i in 0..owner_size.min(size) {
            self.regs[base + i] = self.regs[owner_base + i].clone();
        }
        self.frames[fi].ip = record.body_ip;
        if let Err(err) = self.run_frames(fi) {
            warn!(target: "lattice::vm::unwind", error = %err, "defer.error");
        }
    }

    /// `DeferEnd`: publish the body's register writes back to the owner.
    pub(super) fn finish_defer(&mut self) -> Result<()> {
        let fi = self.frames.len() - 1;
        let FrameKind::Defer { owner } = self.frames[fi].kind else {
            anyhow::bail!("defer end outside a deferred block");
        };
        let (base, size) = (self.frames[fi].base, self.frames[fi].size);
        let (owner_base, owner_size) = (self.frames[owner].base, self.frames[owner].size);
        for i in 0..size.min(owner_size) {
            let value = self.regs[base + i].clone();
            self.set_reg(owner_base + i, value);
        }
        self.leave_frame(true);
        Ok(())
    }
}
