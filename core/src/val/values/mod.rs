//! Runtime value model.
//!
//! A [`Val`] pairs a payload ([`ValKind`]) with a [`Phase`] and a [`Region`]
//! marker. Compound payloads are exclusively owned and deep-cloned on share;
//! `Ref` and `Channel` are the only shared payloads.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};

use crate::rt::Channel;
use crate::util::lat_map::LatMap;

mod closure;
mod display;
mod iter;
mod ops;

pub use closure::{Callable, Closure, ExtensionFn, NativeFn};
pub use iter::{IteratorState, IteratorValue, iteration_in_progress};
pub use ops::CmpOp;

/// Mutability state carried by every value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Fluid,
    Crystal,
    Unphased,
    Sublimated,
}

impl Phase {
    pub const fn name(self) -> &'static str {
        match self {
            Phase::Fluid => "fluid",
            Phase::Crystal => "crystal",
            Phase::Unphased => "unphased",
            Phase::Sublimated => "sublimated",
        }
    }

    pub fn from_name(name: &str) -> Option<Phase> {
        match name {
            "fluid" => Some(Phase::Fluid),
            "crystal" => Some(Phase::Crystal),
            "unphased" => Some(Phase::Unphased),
            "sublimated" => Some(Phase::Sublimated),
            _ => None,
        }
    }
}

/// Identifier of a bulk-owned allocation region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u32);

/// Allocation provenance of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Region {
    /// Conventionally owned; released individually.
    #[default]
    Owned,
    /// Owned in bulk by an arena; releasing the value alone is a no-op.
    Arena(RegionId),
}

impl Region {
    #[inline]
    pub fn is_owned(self) -> bool {
        matches!(self, Region::Owned)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructVal {
    pub name: Arc<str>,
    pub fields: Vec<(Arc<str>, Val)>,
}

impl StructVal {
    pub fn field(&self, name: &str) -> Option<&Val> {
        self.fields.iter().find(|(k, _)| k.as_ref() == name).map(|(_, v)| v)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Val> {
        self.fields.iter_mut().find(|(k, _)| k.as_ref() == name).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumVal {
    pub enum_name: Arc<str>,
    pub variant: Arc<str>,
    pub payload: Vec<Val>,
}

/// Shared, interior-mutable cell behind a `Ref` value.
pub struct RefBox {
    cell: Mutex<Val>,
}

impl RefBox {
    pub fn new(value: Val) -> Arc<Self> {
        Arc::new(Self { cell: Mutex::new(value) })
    }

    pub fn lock(&self) -> MutexGuard<'_, Val> {
        self.cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) -> Val {
        self.lock().clone()
    }

    pub fn set(&self, value: Val) -> Val {
        std::mem::replace(&mut *self.lock(), value)
    }
}

impl fmt::Debug for RefBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefBox").field("type", &self.lock().type_name()).finish()
    }
}

#[derive(Debug, Clone)]
pub enum ValKind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(Arc<str>),
    Array(Vec<Val>),
    Struct(Box<StructVal>),
    Closure(Arc<Closure>),
    Unit,
    Nil,
    Range(i64, i64),
    Map(Box<LatMap<Val>>),
    Channel(Arc<Channel>),
    Enum(Box<EnumVal>),
    Set(Box<LatMap<Val>>),
    Tuple(Vec<Val>),
    Buffer(Vec<u8>),
    Ref(Arc<RefBox>),
    Iterator(Arc<IteratorValue>),
}

impl ValKind {
    /// Phase a freshly constructed payload starts in.
    fn initial_phase(&self) -> Phase {
        match self {
            ValKind::Array(_)
            | ValKind::Struct(_)
            | ValKind::Map(_)
            | ValKind::Enum(_)
            | ValKind::Set(_)
            | ValKind::Buffer(_) => Phase::Fluid,
            ValKind::Tuple(_) => Phase::Crystal,
            _ => Phase::Unphased,
        }
    }
}

pub struct Val {
    pub kind: ValKind,
    pub phase: Phase,
    pub region: Region,
}

/// Cloning is the deep clone: compound payloads are copied, `Ref`/`Channel`
/// handles are retained, and the copy is conventionally owned.
impl Clone for Val {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            phase: self.phase,
            region: Region::Owned,
        }
    }
}

impl fmt::Debug for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repr())?;
        if !matches!(self.phase, Phase::Unphased) {
            write!(f, "@{}", self.phase.name())?;
        }
        Ok(())
    }
}

impl PartialEq for Val {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl From<ValKind> for Val {
    fn from(kind: ValKind) -> Self {
        Val::new(kind)
    }
}

impl Val {
    pub fn new(kind: ValKind) -> Self {
        let phase = kind.initial_phase();
        Self {
            kind,
            phase,
            region: Region::Owned,
        }
    }

    #[inline]
    pub fn int(v: i64) -> Self {
        Val::new(ValKind::Int(v))
    }

    #[inline]
    pub fn float(v: f64) -> Self {
        Val::new(ValKind::Float(v))
    }

    #[inline]
    pub fn bool(v: bool) -> Self {
        Val::new(ValKind::Bool(v))
    }

    pub fn str(v: impl Into<Arc<str>>) -> Self {
        Val::new(ValKind::Str(v.into()))
    }

    #[inline]
    pub fn nil() -> Self {
        Val::new(ValKind::Nil)
    }

    #[inline]
    pub fn unit() -> Self {
        Val::new(ValKind::Unit)
    }

    pub fn array(items: Vec<Val>) -> Self {
        Val::new(ValKind::Array(items))
    }

    pub fn tuple(items: Vec<Val>) -> Self {
        Val::new(ValKind::Tuple(items))
    }

    pub fn map(map: LatMap<Val>) -> Self {
        Val::new(ValKind::Map(Box::new(map)))
    }

    pub fn map_from<K: Into<Arc<str>>>(pairs: impl IntoIterator<Item = (K, Val)>) -> Self {
        Val::map(pairs.into_iter().collect())
    }

    /// Build a set; members are keyed by their display form.
    pub fn set(items: impl IntoIterator<Item = Val>) -> Self {
        let mut members = LatMap::new();
        for item in items {
            members.insert(item.to_string(), item);
        }
        Val::new(ValKind::Set(Box::new(members)))
    }

    pub fn buffer(bytes: Vec<u8>) -> Self {
        Val::new(ValKind::Buffer(bytes))
    }

    pub fn range(start: i64, end: i64) -> Self {
        Val::new(ValKind::Range(start, end))
    }

    pub fn structure(name: impl Into<Arc<str>>, fields: Vec<(Arc<str>, Val)>) -> Self {
        Val::new(ValKind::Struct(Box::new(StructVal {
            name: name.into(),
            fields,
        })))
    }

    pub fn enumeration(enum_name: impl Into<Arc<str>>, variant: impl Into<Arc<str>>, payload: Vec<Val>) -> Self {
        Val::new(ValKind::Enum(Box::new(EnumVal {
            enum_name: enum_name.into(),
            variant: variant.into(),
            payload,
        })))
    }

    pub fn closure(closure: Closure) -> Self {
        Val::new(ValKind::Closure(Arc::new(closure)))
    }

    pub fn native(name: &str, func: NativeFn) -> Self {
        Val::closure(Closure::native(name, func))
    }

    pub fn channel(channel: Arc<Channel>) -> Self {
        Val::new(ValKind::Channel(channel))
    }

    pub fn new_ref(inner: Val) -> Self {
        Val::new(ValKind::Ref(RefBox::new(inner)))
    }

    pub fn iterator(iter: Arc<IteratorValue>) -> Self {
        Val::new(ValKind::Iterator(iter))
    }

    #[inline]
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    #[inline]
    pub fn in_region(mut self, region: RegionId) -> Self {
        self.region = Region::Arena(region);
        self
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            ValKind::Int(_) => "Int",
            ValKind::Float(_) => "Float",
            ValKind::Bool(_) => "Bool",
            ValKind::Str(_) => "String",
            ValKind::Array(_) => "Array",
            ValKind::Struct(_) => "Struct",
            ValKind::Closure(_) => "Closure",
            ValKind::Unit => "Unit",
            ValKind::Nil => "Nil",
            ValKind::Range(..) => "Range",
            ValKind::Map(_) => "Map",
            ValKind::Channel(_) => "Channel",
            ValKind::Enum(_) => "Enum",
            ValKind::Set(_) => "Set",
            ValKind::Tuple(_) => "Tuple",
            ValKind::Buffer(_) => "Buffer",
            ValKind::Ref(_) => "Ref",
            ValKind::Iterator(_) => "Iterator",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match &self.kind {
            ValKind::Bool(b) => *b,
            ValKind::Int(i) => *i != 0,
            ValKind::Float(f) => *f != 0.0,
            ValKind::Str(s) => !s.is_empty(),
            ValKind::Unit | ValKind::Nil => false,
            ValKind::Map(m) | ValKind::Set(m) => !m.is_empty(),
            ValKind::Tuple(items) => !items.is_empty(),
            ValKind::Buffer(bytes) => !bytes.is_empty(),
            _ => true,
        }
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self.kind, ValKind::Nil)
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self.kind {
            ValKind::Int(i) => Some(i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ValKind::Str(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_closure(&self) -> Option<&Arc<Closure>> {
        match &self.kind {
            ValKind::Closure(c) => Some(c),
            _ => None,
        }
    }

    /// Frozen values reject in-place mutation.
    #[inline]
    pub fn is_frozen(&self) -> bool {
        matches!(self.phase, Phase::Crystal | Phase::Sublimated)
    }

    /// Structural equality. Closures never compare equal, not even to
    /// themselves; shared handles compare by identity.
    pub fn equals(&self, other: &Val) -> bool {
        match (&self.kind, &other.kind) {
            (ValKind::Int(a), ValKind::Int(b)) => a == b,
            (ValKind::Float(a), ValKind::Float(b)) => a == b,
            (ValKind::Bool(a), ValKind::Bool(b)) => a == b,
            (ValKind::Str(a), ValKind::Str(b)) => a == b,
            (ValKind::Unit, ValKind::Unit) | (ValKind::Nil, ValKind::Nil) => true,
            (ValKind::Range(a0, a1), ValKind::Range(b0, b1)) => a0 == b0 && a1 == b1,
            (ValKind::Array(a), ValKind::Array(b)) | (ValKind::Tuple(a), ValKind::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (ValKind::Struct(a), ValKind::Struct(b)) => {
                a.name == b.name
                    && a.fields.len() == b.fields.len()
                    && a
                        .fields
                        .iter()
                        .zip(&b.fields)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.equals(vb))
            }
            (ValKind::Enum(a), ValKind::Enum(b)) => {
                a.enum_name == b.enum_name
                    && a.variant == b.variant
                    && a.payload.len() == b.payload.len()
                    && a.payload.iter().zip(&b.payload).all(|(x, y)| x.equals(y))
            }
            (ValKind::Map(a), ValKind::Map(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|o| v.equals(o)))
            }
            (ValKind::Set(a), ValKind::Set(b)) => a.len() == b.len() && a.keys().all(|k| b.contains_key(k)),
            (ValKind::Buffer(a), ValKind::Buffer(b)) => a == b,
            (ValKind::Channel(a), ValKind::Channel(b)) => Arc::ptr_eq(a, b),
            (ValKind::Ref(a), ValKind::Ref(b)) => Arc::ptr_eq(a, b),
            (ValKind::Iterator(a), ValKind::Iterator(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Recursively mark this value and its owned payload crystal.
    pub fn freeze(&mut self) {
        self.set_phase_deep(Phase::Crystal);
    }

    /// Produce a fluid copy of a frozen value.
    pub fn thawed(&self) -> Val {
        let mut copy = self.clone();
        copy.set_phase_deep(Phase::Fluid);
        copy
    }

    /// One-way terminal transition; only the outer value is marked.
    pub fn sublimate(&mut self) {
        self.phase = Phase::Sublimated;
    }

    fn set_phase_deep(&mut self, phase: Phase) {
        self.phase = phase;
        match &mut self.kind {
            ValKind::Array(items) | ValKind::Tuple(items) => items.iter_mut().for_each(|v| v.set_phase_deep(phase)),
            ValKind::Struct(s) => s.fields.iter_mut().for_each(|(_, v)| v.set_phase_deep(phase)),
            ValKind::Enum(e) => e.payload.iter_mut().for_each(|v| v.set_phase_deep(phase)),
            ValKind::Map(m) | ValKind::Set(m) => m.values_mut().for_each(|v| v.set_phase_deep(phase)),
            _ => {}
        }
    }

    /// Rough heap footprint used for collector accounting.
    pub fn heap_size(&self) -> usize {
        let base = std::mem::size_of::<Val>();
        base + match &self.kind {
            ValKind::Str(s) => s.len(),
            ValKind::Array(items) | ValKind::Tuple(items) => items.iter().map(Val::heap_size).sum(),
            ValKind::Struct(s) => s.fields.iter().map(|(k, v)| k.len() + v.heap_size()).sum(),
            ValKind::Enum(e) => e.payload.iter().map(Val::heap_size).sum(),
            ValKind::Map(m) | ValKind::Set(m) => m.iter().map(|(k, v)| k.len() + v.heap_size()).sum(),
            ValKind::Buffer(b) => b.len(),
            _ => 0,
        }
    }

    /// Build a `{tag, value}` result map as produced by `ok(..)`/`err(..)`.
    pub fn result(ok: bool, value: Val) -> Val {
        Val::map_from([("tag", Val::str(if ok { "ok" } else { "err" })), ("value", value)])
    }
}

impl Serialize for Val {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.kind {
            ValKind::Int(i) => serializer.serialize_i64(*i),
            ValKind::Float(f) => serializer.serialize_f64(*f),
            ValKind::Bool(b) => serializer.serialize_bool(*b),
            ValKind::Str(s) => serializer.serialize_str(s),
            ValKind::Nil | ValKind::Unit => serializer.serialize_unit(),
            ValKind::Array(items) | ValKind::Tuple(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            ValKind::Map(m) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m.iter() {
                    map.serialize_entry(k.as_ref(), v)?;
                }
                map.end()
            }
            ValKind::Struct(s) => {
                let mut map = serializer.serialize_map(Some(s.fields.len()))?;
                for (k, v) in &s.fields {
                    map.serialize_entry(k.as_ref(), v)?;
                }
                map.end()
            }
            ValKind::Set(m) => {
                let mut seq = serializer.serialize_seq(Some(m.len()))?;
                for v in m.values() {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            _ => serializer.serialize_str(&self.to_string()),
        }
    }
}
