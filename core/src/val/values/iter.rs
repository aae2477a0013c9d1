use std::cell::Cell;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use core::fmt;

use crate::rt::Host;

use super::Val;

/// Trait implemented by iterator state machines exposed to the runtime.
pub trait IteratorState: Send + 'static {
    /// Advance the iterator; `None` signals exhaustion.
    fn next(&mut self, host: &mut dyn Host) -> Result<Option<Val>>;

    /// Optional size hint used by collectors for pre-allocation.
    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, None)
    }

    /// Human readable identifier used for diagnostics.
    fn debug_name(&self) -> &'static str {
        "iterator"
    }

    /// Visit every value the state holds (sources, callbacks) for the collector.
    fn trace(&self, _visit: &mut dyn FnMut(&Val)) {}
}

thread_local! {
    static ADVANCING: Cell<usize> = const { Cell::new(0) };
}

struct AdvanceGuard;

impl AdvanceGuard {
    fn enter() -> Self {
        ADVANCING.with(|c| c.set(c.get() + 1));
        AdvanceGuard
    }
}

impl Drop for AdvanceGuard {
    fn drop(&mut self) {
        ADVANCING.with(|c| c.set(c.get().saturating_sub(1)));
    }
}

/// Whether an iterator is mid-advance on this thread. Its state is locked and
/// cannot be traced, so collection must wait.
pub fn iteration_in_progress() -> bool {
    ADVANCING.with(|c| c.get() > 0)
}

/// Shared handle to a single-pass iterator.
pub struct IteratorValue {
    origin: Option<Arc<str>>,
    state: Mutex<Box<dyn IteratorState>>,
}

impl fmt::Debug for IteratorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IteratorValue").field("origin", &self.origin).finish()
    }
}

impl IteratorValue {
    pub fn new<S>(state: S) -> Arc<Self>
    where
        S: IteratorState,
    {
        let origin = Some(Arc::from(state.debug_name()));
        Arc::new(Self {
            origin,
            state: Mutex::new(Box::new(state)),
        })
    }

    pub fn with_origin<S>(state: S, origin: Arc<str>) -> Arc<Self>
    where
        S: IteratorState,
    {
        Arc::new(Self {
            origin: Some(origin),
            state: Mutex::new(Box::new(state)),
        })
    }

    pub fn next(&self, host: &mut dyn Host) -> Result<Option<Val>> {
        // A combinator callback advancing its own source would deadlock.
        let mut guard = self
            .state
            .try_lock()
            .map_err(|_| anyhow!("iterator is already being advanced"))?;
        let _advancing = AdvanceGuard::enter();
        guard.next(host)
    }

    pub fn size_hint(&self) -> (usize, Option<usize>) {
        match self.state.lock() {
            Ok(guard) => guard.size_hint(),
            Err(_) => (0, None),
        }
    }

    /// Skipped while the iterator is being advanced.
    pub fn trace(&self, visit: &mut dyn FnMut(&Val)) {
        if let Ok(guard) = self.state.try_lock() {
            guard.trace(visit);
        }
    }

    pub fn origin(&self) -> Option<&Arc<str>> {
        self.origin.as_ref()
    }
}
