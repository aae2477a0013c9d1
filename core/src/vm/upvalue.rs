//! Escaping-variable capture.
//!
//! An upvalue starts open, aliasing a register slot of a live frame, and is
//! closed exactly once when that frame exits (or a close instruction runs).
//! After closing, the cell owns the value and all holders observe it.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::val::Val;

#[derive(Debug, Clone)]
pub enum Upvalue {
    /// Alias of `slot` in the register window of frame `frame`.
    Open { frame: usize, slot: usize },
    Closed(Val),
}

#[derive(Debug)]
pub struct UpvalueCell {
    state: Mutex<Upvalue>,
}

pub type UpvalueRef = Arc<UpvalueCell>;

impl UpvalueCell {
    pub fn open(frame: usize, slot: usize) -> UpvalueRef {
        Arc::new(Self {
            state: Mutex::new(Upvalue::Open { frame, slot }),
        })
    }

    pub fn closed(value: Val) -> UpvalueRef {
        Arc::new(Self {
            state: Mutex::new(Upvalue::Closed(value)),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, Upvalue> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `(frame, slot)` while open.
    pub fn location(&self) -> Option<(usize, usize)> {
        match *self.state() {
            Upvalue::Open { frame, slot } => Some((frame, slot)),
            Upvalue::Closed(_) => None,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.location().is_some()
    }

    /// Snapshot `value` into the cell. Closing twice keeps the first value.
    pub fn close(&self, value: Val) -> bool {
        let mut state = self.state();
        if matches!(*state, Upvalue::Open { .. }) {
            *state = Upvalue::Closed(value);
            true
        } else {
            false
        }
    }

    /// Copy that aliases nothing: open cells are resolved through `resolve`.
    pub fn detached(&self, resolve: &dyn Fn(usize, usize) -> Val) -> UpvalueRef {
        let value = match &*self.state() {
            Upvalue::Open { frame, slot } => resolve(*frame, *slot),
            Upvalue::Closed(v) => v.clone(),
        };
        UpvalueCell::closed(value)
    }

    /// Drop the owned value of a closed cell. Used by the collector to break
    /// cycles through unreachable cells.
    pub(crate) fn clear(&self) {
        let mut state = self.state();
        if let Upvalue::Closed(v) = &mut *state {
            *v = Val::nil();
        }
    }
}
