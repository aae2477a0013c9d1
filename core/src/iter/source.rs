use std::sync::Arc;

use anyhow::{Result, bail};

use crate::rt::Host;
use crate::val::{IteratorState, Val};

/// Items copied out of a collection when iteration starts.
pub struct ArraySource {
    items: std::vec::IntoIter<Val>,
}

impl ArraySource {
    pub fn new(items: Vec<Val>) -> Self {
        Self { items: items.into_iter() }
    }
}

impl IteratorState for ArraySource {
    fn next(&mut self, _host: &mut dyn Host) -> Result<Option<Val>> {
        Ok(self.items.next())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }

    fn debug_name(&self) -> &'static str {
        "array"
    }

    fn trace(&self, visit: &mut dyn FnMut(&Val)) {
        self.items.as_slice().iter().for_each(visit);
    }
}

/// Lazy arithmetic progression; `end` is exclusive.
pub struct RangeSource {
    next: i64,
    end: i64,
    step: i64,
}

impl RangeSource {
    pub fn new(start: i64, end: i64, step: i64) -> Result<Self> {
        if step == 0 {
            bail!("range step cannot be zero");
        }
        Ok(Self { next: start, end, step })
    }

    fn remaining(&self) -> usize {
        let span = if self.step > 0 {
            self.end.saturating_sub(self.next)
        } else {
            self.next.saturating_sub(self.end)
        };
        if span <= 0 {
            return 0;
        }
        let step = self.step.unsigned_abs();
        usize::try_from((span as u64).div_ceil(step)).unwrap_or(usize::MAX)
    }
}

impl IteratorState for RangeSource {
    fn next(&mut self, _host: &mut dyn Host) -> Result<Option<Val>> {
        let live = if self.step > 0 { self.next < self.end } else { self.next > self.end };
        if !live {
            return Ok(None);
        }
        let current = self.next;
        match current.checked_add(self.step) {
            Some(next) => self.next = next,
            None => self.next = self.end,
        }
        Ok(Some(Val::int(current)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }

    fn debug_name(&self) -> &'static str {
        "range"
    }
}

/// Characters of a string, one single-character string at a time.
pub struct CharsSource {
    text: Arc<str>,
    pos: usize,
}

impl CharsSource {
    pub fn new(text: Arc<str>) -> Self {
        Self { text, pos: 0 }
    }
}

impl IteratorState for CharsSource {
    fn next(&mut self, _host: &mut dyn Host) -> Result<Option<Val>> {
        let Some(ch) = self.text[self.pos..].chars().next() else {
            return Ok(None);
        };
        self.pos += ch.len_utf8();
        let mut buf = [0u8; 4];
        Ok(Some(Val::str(&*ch.encode_utf8(&mut buf))))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.text.len() - self.pos;
        (rest.div_ceil(4), Some(rest))
    }

    fn debug_name(&self) -> &'static str {
        "chars"
    }
}

/// The same value `count` times, or forever.
pub struct RepeatSource {
    value: Val,
    remaining: Option<u64>,
}

impl RepeatSource {
    pub fn new(value: Val, count: Option<u64>) -> Self {
        Self { value, remaining: count }
    }
}

impl IteratorState for RepeatSource {
    fn next(&mut self, _host: &mut dyn Host) -> Result<Option<Val>> {
        match &mut self.remaining {
            Some(0) => Ok(None),
            Some(n) => {
                *n -= 1;
                Ok(Some(self.value.clone()))
            }
            None => Ok(Some(self.value.clone())),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.remaining {
            Some(n) => {
                let n = usize::try_from(n).unwrap_or(usize::MAX);
                (n, Some(n))
            }
            None => (usize::MAX, None),
        }
    }

    fn debug_name(&self) -> &'static str {
        "repeat"
    }

    fn trace(&self, visit: &mut dyn FnMut(&Val)) {
        visit(&self.value);
    }
}
