use std::sync::Arc;

use anyhow::Result;

use crate::rt::Host;
use crate::val::{IteratorState, IteratorValue, Val, ValKind};

/// Upstream iterator held by an adapter. Stored only as a value so the
/// collector sees exactly one edge to it.
struct Upstream {
    value: Val,
}

impl Upstream {
    fn new(iter: Arc<IteratorValue>) -> Self {
        Self {
            value: Val::iterator(iter),
        }
    }

    fn iter(&self) -> Option<&Arc<IteratorValue>> {
        match &self.value.kind {
            ValKind::Iterator(iter) => Some(iter),
            _ => None,
        }
    }

    #[inline]
    fn next(&self, host: &mut dyn Host) -> Result<Option<Val>> {
        match self.iter() {
            Some(iter) => iter.next(host),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter().map_or((0, Some(0)), |iter| iter.size_hint())
    }
}

pub struct MapAdapter {
    source: Upstream,
    func: Val,
}

impl MapAdapter {
    pub fn new(source: Arc<IteratorValue>, func: Val) -> Self {
        Self {
            source: Upstream::new(source),
            func,
        }
    }
}

impl IteratorState for MapAdapter {
    fn next(&mut self, host: &mut dyn Host) -> Result<Option<Val>> {
        match self.source.next(host)? {
            Some(item) => host.call_closure(&self.func, &[item]).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.source.size_hint()
    }

    fn debug_name(&self) -> &'static str {
        "map"
    }

    fn trace(&self, visit: &mut dyn FnMut(&Val)) {
        visit(&self.source.value);
        visit(&self.func);
    }
}

pub struct FilterAdapter {
    source: Upstream,
    pred: Val,
}

impl FilterAdapter {
    pub fn new(source: Arc<IteratorValue>, pred: Val) -> Self {
        Self {
            source: Upstream::new(source),
            pred,
        }
    }
}

impl IteratorState for FilterAdapter {
    fn next(&mut self, host: &mut dyn Host) -> Result<Option<Val>> {
        while let Some(item) = self.source.next(host)? {
            if host.call_closure(&self.pred, std::slice::from_ref(&item))?.is_truthy() {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.source.size_hint().1)
    }

    fn debug_name(&self) -> &'static str {
        "filter"
    }

    fn trace(&self, visit: &mut dyn FnMut(&Val)) {
        visit(&self.source.value);
        visit(&self.pred);
    }
}

pub struct TakeAdapter {
    source: Upstream,
    remaining: usize,
}

impl TakeAdapter {
    pub fn new(source: Arc<IteratorValue>, count: usize) -> Self {
        Self {
            source: Upstream::new(source),
            remaining: count,
        }
    }
}

impl IteratorState for TakeAdapter {
    fn next(&mut self, host: &mut dyn Host) -> Result<Option<Val>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.source.next(host)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (lo, hi) = self.source.size_hint();
        let hi = hi.map_or(self.remaining, |hi| hi.min(self.remaining));
        (lo.min(self.remaining), Some(hi))
    }

    fn debug_name(&self) -> &'static str {
        "take"
    }

    fn trace(&self, visit: &mut dyn FnMut(&Val)) {
        visit(&self.source.value);
    }
}

/// Drops the first `count` items, on the first call to `next`.
pub struct SkipAdapter {
    source: Upstream,
    pending: usize,
}

impl SkipAdapter {
    pub fn new(source: Arc<IteratorValue>, count: usize) -> Self {
        Self {
            source: Upstream::new(source),
            pending: count,
        }
    }
}

impl IteratorState for SkipAdapter {
    fn next(&mut self, host: &mut dyn Host) -> Result<Option<Val>> {
        while self.pending > 0 {
            self.pending -= 1;
            if self.source.next(host)?.is_none() {
                self.pending = 0;
                return Ok(None);
            }
        }
        self.source.next(host)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (lo, hi) = self.source.size_hint();
        (lo.saturating_sub(self.pending), hi.map(|hi| hi.saturating_sub(self.pending)))
    }

    fn debug_name(&self) -> &'static str {
        "skip"
    }

    fn trace(&self, visit: &mut dyn FnMut(&Val)) {
        visit(&self.source.value);
    }
}

/// Yields `[index, item]` pairs.
pub struct EnumerateAdapter {
    source: Upstream,
    index: i64,
}

impl EnumerateAdapter {
    pub fn new(source: Arc<IteratorValue>) -> Self {
        Self {
            source: Upstream::new(source),
            index: 0,
        }
    }
}

impl IteratorState for EnumerateAdapter {
    fn next(&mut self, host: &mut dyn Host) -> Result<Option<Val>> {
        let Some(item) = self.source.next(host)? else {
            return Ok(None);
        };
        let pair = Val::array(vec![Val::int(self.index), item]);
        self.index += 1;
        Ok(Some(pair))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.source.size_hint()
    }

    fn debug_name(&self) -> &'static str {
        "enumerate"
    }

    fn trace(&self, visit: &mut dyn FnMut(&Val)) {
        visit(&self.source.value);
    }
}

/// Yields `[left, right]` pairs until either side runs out.
pub struct ZipAdapter {
    left: Upstream,
    right: Upstream,
}

impl ZipAdapter {
    pub fn new(left: Arc<IteratorValue>, right: Arc<IteratorValue>) -> Self {
        Self {
            left: Upstream::new(left),
            right: Upstream::new(right),
        }
    }
}

impl IteratorState for ZipAdapter {
    fn next(&mut self, host: &mut dyn Host) -> Result<Option<Val>> {
        let Some(a) = self.left.next(host)? else {
            return Ok(None);
        };
        let Some(b) = self.right.next(host)? else {
            return Ok(None);
        };
        Ok(Some(Val::array(vec![a, b])))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (llo, lhi) = self.left.size_hint();
        let (rlo, rhi) = self.right.size_hint();
        let hi = match (lhi, rhi) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        (llo.min(rlo), hi)
    }

    fn debug_name(&self) -> &'static str {
        "zip"
    }

    fn trace(&self, visit: &mut dyn FnMut(&Val)) {
        visit(&self.left.value);
        visit(&self.right.value);
    }
}
