use anyhow::{Result, anyhow, bail};

use crate::util::lat_map::LatMap;
use crate::val::{Val, ValKind};
use crate::vm::vm::Vm;

pub(super) fn get_field(obj: &Val, name: &str) -> Result<Val> {
    match &obj.kind {
        ValKind::Struct(s) => s
            .field(name)
            .cloned()
            .ok_or_else(|| anyhow!("struct '{}' has no field '{name}'", s.name)),
        ValKind::Map(map) => Ok(map.get(name).cloned().unwrap_or_else(Val::nil)),
        ValKind::Enum(e) => match name {
            "variant" => Ok(Val::str(e.variant.clone())),
            "name" => Ok(Val::str(e.enum_name.clone())),
            "payload" => Ok(Val::array(e.payload.clone())),
            _ => bail!("enum has no field '{name}'"),
        },
        ValKind::Tuple(items) => name
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i))
            .cloned()
            .ok_or_else(|| anyhow!("tuple has no field '{name}'")),
        ValKind::Ref(cell) => get_field(&cell.lock(), name),
        _ => bail!("cannot access field '{name}' on {}", obj.type_name()),
    }
}

fn assign_field(target: &mut Val, name: &str, value: Val) -> Result<()> {
    if let ValKind::Ref(cell) = &target.kind {
        if target.is_frozen() {
            bail!("cannot mutate a frozen Ref");
        }
        return assign_field(&mut cell.lock(), name, value);
    }
    if target.is_frozen() {
        bail!("cannot modify a frozen value");
    }
    match &mut target.kind {
        ValKind::Struct(s) => {
            let struct_name = s.name.clone();
            let Some(slot) = s.field_mut(name) else {
                bail!("struct '{struct_name}' has no field '{name}'");
            };
            if slot.is_frozen() {
                bail!("cannot assign to frozen field '{name}'");
            }
            *slot = value;
            Ok(())
        }
        ValKind::Map(map) => {
            map.insert(name, value);
            Ok(())
        }
        _ => bail!("cannot access field '{name}' on {}", target.type_name()),
    }
}

pub(super) fn get_index(obj: &Val, index: &Val) -> Result<Val> {
    match (&obj.kind, &index.kind) {
        (ValKind::Array(items) | ValKind::Tuple(items), ValKind::Int(i)) => usize::try_from(*i)
            .ok()
            .and_then(|i| items.get(i))
            .cloned()
            .ok_or_else(|| anyhow!("array index {i} out of bounds (len {})", items.len())),
        (ValKind::Array(items), ValKind::Range(start, end)) => {
            let (start, end) = clamp_range(*start, *end, items.len());
            Ok(Val::array(items[start..end].to_vec()))
        }
        (ValKind::Array(_) | ValKind::Tuple(_), _) => bail!("array index must be an integer"),
        (ValKind::Map(map), ValKind::Str(key)) => Ok(map.get(key).cloned().unwrap_or_else(Val::nil)),
        (ValKind::Map(_), _) => bail!("map key must be a string"),
        (ValKind::Str(text), ValKind::Int(i)) => usize::try_from(*i)
            .ok()
            .and_then(|i| text.chars().nth(i))
            .map(|c| Val::str(c.to_string()))
            .ok_or_else(|| anyhow!("string index out of bounds")),
        (ValKind::Str(text), ValKind::Range(start, end)) => {
            let count = text.chars().count();
            let (start, end) = clamp_range(*start, *end, count);
            Ok(Val::str(text.chars().skip(start).take(end - start).collect::<String>()))
        }
        (ValKind::Buffer(bytes), ValKind::Int(i)) => usize::try_from(*i)
            .ok()
            .and_then(|i| bytes.get(i))
            .map(|b| Val::int(i64::from(*b)))
            .ok_or_else(|| anyhow!("buffer index out of bounds")),
        (ValKind::Ref(cell), _) => get_index(&cell.lock(), index),
        _ => bail!("cannot index {}", obj.type_name()),
    }
}

fn clamp_range(start: i64, end: i64, len: usize) -> (usize, usize) {
    let clamp = |v: i64| v.clamp(0, len as i64) as usize;
    let (start, end) = (clamp(start), clamp(end));
    (start, end.max(start))
}

fn assign_index(target: &mut Val, index: &Val, value: Val) -> Result<()> {
    if let ValKind::Ref(cell) = &target.kind {
        if target.is_frozen() {
            bail!("cannot mutate a frozen Ref");
        }
        return assign_index(&mut cell.lock(), index, value);
    }
    if target.is_frozen() {
        bail!("cannot modify a frozen value");
    }
    let type_name = target.type_name();
    match (&mut target.kind, &index.kind) {
        (ValKind::Array(items), ValKind::Int(i)) => {
            let len = items.len();
            let Some(slot) = usize::try_from(*i).ok().and_then(|i| items.get_mut(i)) else {
                bail!("array index {i} out of bounds (len {len})");
            };
            *slot = value;
            Ok(())
        }
        (ValKind::Array(_), _) => bail!("array index must be an integer"),
        (ValKind::Map(map), ValKind::Str(key)) => {
            map.insert(key.clone(), value);
            Ok(())
        }
        (ValKind::Map(_), _) => bail!("map key must be a string"),
        (ValKind::Buffer(bytes), ValKind::Int(i)) => {
            let Some(slot) = usize::try_from(*i).ok().and_then(|i| bytes.get_mut(i)) else {
                bail!("buffer index out of bounds");
            };
            let Some(byte) = value.as_int() else {
                bail!("buffer values must be integers");
            };
            *slot = byte as u8;
            Ok(())
        }
        _ => bail!("cannot set index on {type_name}"),
    }
}

/// Element count of `start..end`, saturating for spans beyond `i64`.
pub(super) fn range_len(start: i64, end: i64) -> i64 {
    end.saturating_sub(start).max(0)
}

pub(super) fn length(value: &Val) -> Result<Val> {
    let len = match &value.kind {
        ValKind::Array(items) | ValKind::Tuple(items) => items.len(),
        ValKind::Str(text) => text.chars().count(),
        ValKind::Map(map) | ValKind::Set(map) => map.len(),
        ValKind::Buffer(bytes) => bytes.len(),
        ValKind::Range(start, end) => return Ok(Val::int(range_len(*start, *end))),
        ValKind::Ref(cell) => return length(&cell.lock()),
        _ => bail!("cannot get length of {}", value.type_name()),
    };
    Ok(Val::int(len as i64))
}

/// Map literal from alternating key/value registers.
pub(super) fn new_map(pairs: &[Val]) -> Result<Val> {
    let mut map = LatMap::with_capacity(pairs.len() / 2);
    for pair in pairs.chunks_exact(2) {
        let ValKind::Str(key) = &pair[0].kind else {
            bail!("map key must be a string");
        };
        map.insert(key.clone(), pair[1].clone());
    }
    Ok(Val::map(map))
}

/// `Buffer(n)` zero-filled, or the bytes of an Array of ints or a String.
pub(super) fn new_buffer(source: &Val) -> Result<Val> {
    let bytes = match &source.kind {
        ValKind::Int(n) => {
            let Ok(n) = usize::try_from(*n) else {
                bail!("buffer size must be non-negative");
            };
            vec![0; n]
        }
        ValKind::Array(items) => items
            .iter()
            .map(|v| v.as_int().map(|b| b as u8))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| anyhow!("buffer values must be integers"))?,
        ValKind::Str(text) => text.as_bytes().to_vec(),
        _ => bail!("cannot build a Buffer from {}", source.type_name()),
    };
    Ok(Val::buffer(bytes))
}

impl Vm {
    pub(super) fn set_field(&mut self, abs: usize, name: &str, value: Val) -> Result<()> {
        assign_field(&mut self.regs[abs], name, value)
    }

    pub(super) fn set_index(&mut self, fi: usize, abs: usize, index: &Val, value: Val) -> Result<()> {
        if let (ValKind::Map(map), ValKind::Str(key)) = (&self.regs[abs].kind, &index.kind) {
            if !map.contains_key(key) {
                let slot = abs - self.frames[fi].base;
                if let Some(name) = self.frames[fi].chunk.local_name(slot) {
                    self.rt.check_pressure(name, "insert", true)?;
                }
            }
        }
        assign_index(&mut self.regs[abs], index, value)
    }

    /// Struct literal; fields arrive in declaration order.
    pub(super) fn new_struct(&self, name: &str, values: &[Val]) -> Result<Val> {
        let Some(fields) = self.rt.struct_fields(name) else {
            bail!("unknown struct '{name}'");
        };
        if fields.len() != values.len() {
            bail!("struct '{name}' field count mismatch");
        }
        let fields = fields.iter().cloned().zip(values.iter().cloned()).collect();
        Ok(Val::structure(name, fields))
    }
}
