//! Lazy iterator sources, adapters and consumers.
//!
//! Every iterator is single pass: adapters pull from their upstream on
//! demand and nothing rewinds. Callbacks run through the [`Host`] passed to
//! each `next` call.

use std::sync::Arc;

use anyhow::{Result, bail};

use crate::rt::Host;
use crate::val::{IteratorValue, Val, ValKind};

mod adapter;
mod source;

pub use adapter::{EnumerateAdapter, FilterAdapter, MapAdapter, SkipAdapter, TakeAdapter, ZipAdapter};
pub use source::{ArraySource, CharsSource, RangeSource, RepeatSource};


/// Iterator over `value`. Collections are snapshotted; an iterator value is
/// returned as is, sharing its position.
pub fn from_value(value: &Val) -> Result<Arc<IteratorValue>> {
    Ok(match &value.kind {
        ValKind::Iterator(iter) => iter.clone(),
        ValKind::Array(items) | ValKind::Tuple(items) => IteratorValue::new(ArraySource::new(items.clone())),
        ValKind::Range(start, end) => IteratorValue::new(RangeSource::new(*start, *end, 1)?),
        ValKind::Map(map) => {
            let keys = map.keys().map(|k| Val::str(k.clone())).collect();
            IteratorValue::with_origin(ArraySource::new(keys), Arc::from("map keys"))
        }
        ValKind::Set(members) => {
            IteratorValue::with_origin(ArraySource::new(members.values().cloned().collect()), Arc::from("set"))
        }
        ValKind::Str(text) => IteratorValue::new(CharsSource::new(text.clone())),
        ValKind::Buffer(bytes) => IteratorValue::with_origin(
            ArraySource::new(bytes.iter().map(|b| Val::int(i64::from(*b))).collect()),
            Arc::from("buffer"),
        ),
        _ => bail!("cannot iterate over {}", value.type_name()),
    })
}

pub fn range(start: i64, end: i64, step: i64) -> Result<Arc<IteratorValue>> {
    Ok(IteratorValue::new(RangeSource::new(start, end, step)?))
}

pub fn repeat(value: Val, count: Option<u64>) -> Arc<IteratorValue> {
    IteratorValue::new(RepeatSource::new(value, count))
}

pub fn map(source: Arc<IteratorValue>, func: Val) -> Arc<IteratorValue> {
    IteratorValue::new(MapAdapter::new(source, func))
}

pub fn filter(source: Arc<IteratorValue>, pred: Val) -> Arc<IteratorValue> {
    IteratorValue::new(FilterAdapter::new(source, pred))
}

pub fn take(source: Arc<IteratorValue>, count: usize) -> Arc<IteratorValue> {
    IteratorValue::new(TakeAdapter::new(source, count))
}

pub fn skip(source: Arc<IteratorValue>, count: usize) -> Arc<IteratorValue> {
    IteratorValue::new(SkipAdapter::new(source, count))
}

pub fn enumerate(source: Arc<IteratorValue>) -> Arc<IteratorValue> {
    IteratorValue::new(EnumerateAdapter::new(source))
}

pub fn zip(left: Arc<IteratorValue>, right: Arc<IteratorValue>) -> Arc<IteratorValue> {
    IteratorValue::new(ZipAdapter::new(left, right))
}

/// Drain into an array.
pub fn collect(iter: &IteratorValue, host: &mut dyn Host) -> Result<Vec<Val>> {
    let (lower, _) = iter.size_hint();
    let mut out = Vec::with_capacity(lower.min(1 << 16));
    while let Some(item) = iter.next(host)? {
        out.push(item);
    }
    Ok(out)
}

/// Left fold: `acc = func(acc, item)`.
pub fn reduce(iter: &IteratorValue, func: &Val, init: Val, host: &mut dyn Host) -> Result<Val> {
    let mut acc = init;
    while let Some(item) = iter.next(host)? {
        acc = host.call_closure(func, &[acc, item])?;
    }
    Ok(acc)
}

/// Stops at the first item for which `pred` is truthy.
pub fn any(iter: &IteratorValue, pred: &Val, host: &mut dyn Host) -> Result<bool> {
    while let Some(item) = iter.next(host)? {
        if host.call_closure(pred, &[item])?.is_truthy() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Stops at the first item for which `pred` is falsy.
pub fn all(iter: &IteratorValue, pred: &Val, host: &mut dyn Host) -> Result<bool> {
    while let Some(item) = iter.next(host)? {
        if !host.call_closure(pred, &[item])?.is_truthy() {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn count(iter: &IteratorValue, host: &mut dyn Host) -> Result<usize> {
    let mut n = 0;
    while iter.next(host)?.is_some() {
        n += 1;
    }
    Ok(n)
}

pub fn for_each(iter: &IteratorValue, func: &Val, host: &mut dyn Host) -> Result<()> {
    while let Some(item) = iter.next(host)? {
        host.call_closure(func, &[item])?;
    }
    Ok(())
}
