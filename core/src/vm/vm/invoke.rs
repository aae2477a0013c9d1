//! Method calls on values.
//!
//! Resolution order: in-place mutators on the receiver register, pure
//! queries, callback methods (eager on collections, lazy on iterators), a
//! callable field of the receiver, and finally a global named
//! `Type::method` called with the receiver first.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};

use crate::iter;
use crate::val::{Val, ValKind};
use crate::vm::bytecode::Reg;
use crate::vm::vm::Vm;
use crate::vm::vm::access::range_len;

/// Upper bound on `Range.to_array()`.
const MAX_RANGE_ELEMENTS: i64 = 1 << 24;

fn arg<'a>(args: &'a [Val], i: usize, method: &str) -> Result<&'a Val> {
    args.get(i)
        .ok_or_else(|| anyhow!("method '{method}' expects at least {} argument(s)", i + 1))
}

fn int_arg(args: &[Val], i: usize, method: &str) -> Result<i64> {
    arg(args, i, method)?
        .as_int()
        .ok_or_else(|| anyhow!("method '{method}' expects an integer argument"))
}

fn str_arg<'a>(args: &'a [Val], i: usize, method: &str) -> Result<&'a str> {
    arg(args, i, method)?
        .as_str()
        .ok_or_else(|| anyhow!("method '{method}' expects a string argument"))
}

/// Pressure direction of a mutator: `Some(true)` grows, `Some(false)` shrinks.
fn mutator(kind: &ValKind, method: &str) -> Option<(&'static str, Option<bool>)> {
    Some(match (kind, method) {
        (ValKind::Array(_) | ValKind::Buffer(_), "push") => ("push to", Some(true)),
        (ValKind::Array(_) | ValKind::Buffer(_), "pop") => ("pop from", Some(false)),
        (ValKind::Array(_), "insert") => ("insert into", Some(true)),
        (ValKind::Array(_), "remove") => ("remove from", Some(false)),
        (ValKind::Array(_), "set") => ("set on", None),
        (ValKind::Map(_), "set" | "insert") => ("insert into", Some(true)),
        (ValKind::Map(_), "remove") => ("remove from", Some(false)),
        (ValKind::Set(_), "add") => ("add to", Some(true)),
        (ValKind::Set(_), "remove") => ("remove from", Some(false)),
        (ValKind::Array(_) | ValKind::Map(_) | ValKind::Set(_) | ValKind::Buffer(_), "clear") => ("clear", Some(false)),
        (ValKind::Ref(_), "set") => ("set", None),
        _ => return None,
    })
}

fn display_items(items: &[Val]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

/// Methods that read the receiver without calling back into the engine.
fn query(receiver: &Val, method: &str, args: &[Val]) -> Result<Option<Val>> {
    let value = match (&receiver.kind, method) {
        (_, "to_string") => Val::str(receiver.to_string()),
        (_, "clone") => receiver.clone(),
        (ValKind::Array(items) | ValKind::Tuple(items), _) => match method {
            "len" => Val::int(items.len() as i64),
            "is_empty" => Val::bool(items.is_empty()),
            "contains" => {
                let needle = arg(args, 0, method)?;
                Val::bool(items.iter().any(|v| v.equals(needle)))
            }
            "index_of" => {
                let needle = arg(args, 0, method)?;
                Val::int(items.iter().position(|v| v.equals(needle)).map_or(-1, |i| i as i64))
            }
            "first" => items.first().cloned().unwrap_or_else(Val::nil),
            "last" => items.last().cloned().unwrap_or_else(Val::nil),
            "get" => {
                let i = int_arg(args, 0, method)?;
                usize::try_from(i).ok().and_then(|i| items.get(i)).cloned().unwrap_or_else(Val::nil)
            }
            "join" => {
                let sep = match args.first() {
                    Some(v) => v.as_str().ok_or_else(|| anyhow!("method 'join' expects a string argument"))?,
                    None => "",
                };
                Val::str(display_items(items).join(sep))
            }
            "reverse" => Val::array(items.iter().rev().cloned().collect()),
            "slice" => {
                let start = int_arg(args, 0, method)?.clamp(0, items.len() as i64) as usize;
                let end = match args.get(1) {
                    Some(_) => int_arg(args, 1, method)?.clamp(0, items.len() as i64) as usize,
                    None => items.len(),
                };
                Val::array(items[start..end.max(start)].to_vec())
            }
            _ => return Ok(None),
        },
        (ValKind::Str(text), _) => match method {
            "len" => Val::int(text.chars().count() as i64),
            "is_empty" => Val::bool(text.is_empty()),
            "contains" => Val::bool(text.contains(str_arg(args, 0, method)?)),
            "starts_with" => Val::bool(text.starts_with(str_arg(args, 0, method)?)),
            "ends_with" => Val::bool(text.ends_with(str_arg(args, 0, method)?)),
            "index_of" => {
                let needle = str_arg(args, 0, method)?;
                Val::int(text.find(needle).map_or(-1, |byte| text[..byte].chars().count() as i64))
            }
            "upper" | "to_upper" => Val::str(text.to_uppercase()),
            "lower" | "to_lower" => Val::str(text.to_lowercase()),
            "trim" => Val::str(text.trim()),
            "split" => {
                let sep = str_arg(args, 0, method)?;
                Val::array(text.split(sep).map(Val::str).collect())
            }
            "replace" => Val::str(text.replace(str_arg(args, 0, method)?, str_arg(args, 1, method)?)),
            "chars" => Val::array(text.chars().map(|c| Val::str(c.to_string())).collect()),
            "bytes" => Val::buffer(text.as_bytes().to_vec()),
            _ => return Ok(None),
        },
        (ValKind::Map(map), _) => match method {
            "len" => Val::int(map.len() as i64),
            "is_empty" => Val::bool(map.is_empty()),
            "has" | "contains_key" => Val::bool(map.contains_key(str_arg(args, 0, method)?)),
            "get" => map.get(str_arg(args, 0, method)?).cloned().unwrap_or_else(Val::nil),
            "keys" => Val::array(map.keys().map(|k| Val::str(k.clone())).collect()),
            "values" => Val::array(map.values().cloned().collect()),
            "entries" => Val::array(
                map.iter()
                    .map(|(k, v)| Val::array(vec![Val::str(k.clone()), v.clone()]))
                    .collect(),
            ),
            _ => return Ok(None),
        },
        (ValKind::Set(members), _) => match method {
            "len" => Val::int(members.len() as i64),
            "is_empty" => Val::bool(members.is_empty()),
            "contains" | "has" => Val::bool(members.contains_key(&arg(args, 0, method)?.to_string())),
            "values" | "to_array" => Val::array(members.values().cloned().collect()),
            _ => return Ok(None),
        },
        (ValKind::Buffer(bytes), _) => match method {
            "len" => Val::int(bytes.len() as i64),
            "is_empty" => Val::bool(bytes.is_empty()),
            "to_array" => Val::array(bytes.iter().map(|b| Val::int(i64::from(*b))).collect()),
            "decode" => Val::str(String::from_utf8_lossy(bytes).into_owned()),
            _ => return Ok(None),
        },
        (ValKind::Range(start, end), _) => match method {
            "len" => Val::int(range_len(*start, *end)),
            "contains" => {
                let i = int_arg(args, 0, method)?;
                Val::bool(*start <= i && i < *end)
            }
            "to_array" => {
                let len = range_len(*start, *end);
                if len > MAX_RANGE_ELEMENTS {
                    bail!("range too large to materialize ({len} elements)");
                }
                Val::array((*start..*end).map(Val::int).collect())
            }
            _ => return Ok(None),
        },
        (ValKind::Channel(ch), _) => match method {
            "send" => Val::bool(ch.send(arg(args, 0, method)?.clone())),
            "recv" => ch.recv().unwrap_or_else(Val::nil),
            "try_recv" => match ch.try_recv() {
                crate::rt::TryRecv::Value(v) => v,
                _ => Val::nil(),
            },
            "close" => {
                ch.close();
                Val::unit()
            }
            "is_closed" => Val::bool(ch.is_closed()),
            "len" => Val::int(ch.len() as i64),
            _ => return Ok(None),
        },
        (ValKind::Ref(cell), "get") => cell.get(),
        (ValKind::Enum(e), "is") => Val::bool(e.variant.as_ref() == str_arg(args, 0, method)?),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

impl Vm {
    /// `Invoke`: `R[dst] = R[obj].method(R[start..start+argc])`.
    pub(super) fn invoke(&mut self, fi: usize, dst: Reg, obj: Reg, method: &str, start: Reg, argc: u16) -> Result<()> {
        let base = self.frames[fi].base;
        let abs = base + obj as usize;
        let first = base + start as usize;
        let args = self.regs[first..first + argc as usize].to_vec();

        let result = if let Some(result) = self.mutate_in_place(fi, obj, method, &args)? {
            self.record_local(fi, obj);
            result
        } else if let Some(result) = query(&self.regs[abs], method, &args)? {
            result
        } else {
            let receiver = self.regs[abs].clone();
            self.call_method(receiver, method, &args)?
        };
        self.set_reg(base + dst as usize, result);
        Ok(())
    }

    fn mutate_in_place(&mut self, fi: usize, obj: Reg, method: &str, args: &[Val]) -> Result<Option<Val>> {
        let abs = self.frames[fi].base + obj as usize;
        let target = &self.regs[abs];
        let Some((phrase, direction)) = mutator(&target.kind, method) else {
            return Ok(None);
        };
        if target.is_frozen() {
            if matches!(target.kind, ValKind::Ref(_)) {
                bail!("cannot mutate a frozen Ref");
            }
            bail!(
                "cannot {phrase} a {} {}",
                target.phase.name(),
                target.type_name().to_lowercase()
            );
        }
        if let Some(grows) = direction {
            let adds_key = match (&target.kind, method) {
                (ValKind::Map(map), "set" | "insert") => !map.contains_key(str_arg(args, 0, method)?),
                _ => true,
            };
            if adds_key {
                if let Some(name) = self.frames[fi].chunk.local_name(obj as usize) {
                    self.rt.check_pressure(name, method, grows)?;
                }
            }
        }

        let result = match (&mut self.regs[abs].kind, method) {
            (ValKind::Array(items), "push") => {
                items.push(arg(args, 0, method)?.clone());
                Val::unit()
            }
            (ValKind::Array(items), "pop") => items.pop().unwrap_or_else(Val::nil),
            (ValKind::Array(items), "insert") => {
                let i = int_arg(args, 0, method)?;
                let value = arg(args, 1, method)?.clone();
                let len = items.len();
                let Some(i) = usize::try_from(i).ok().filter(|i| *i <= len) else {
                    bail!("array index {i} out of bounds (len {len})");
                };
                items.insert(i, value);
                Val::unit()
            }
            (ValKind::Array(items), "remove") => {
                let i = int_arg(args, 0, method)?;
                let len = items.len();
                let Some(i) = usize::try_from(i).ok().filter(|i| *i < len) else {
                    bail!("array index {i} out of bounds (len {len})");
                };
                items.remove(i)
            }
            (ValKind::Array(items), "set") => {
                let i = int_arg(args, 0, method)?;
                let len = items.len();
                let Some(slot) = usize::try_from(i).ok().and_then(|i| items.get_mut(i)) else {
                    bail!("array index {i} out of bounds (len {len})");
                };
                *slot = arg(args, 1, method)?.clone();
                Val::unit()
            }
            (ValKind::Map(map), "set" | "insert") => {
                let key: Arc<str> = Arc::from(str_arg(args, 0, method)?);
                map.insert(key, arg(args, 1, method)?.clone());
                Val::unit()
            }
            (ValKind::Map(map), "remove") => map.remove(str_arg(args, 0, method)?).unwrap_or_else(Val::nil),
            (ValKind::Set(members), "add") => {
                let value = arg(args, 0, method)?.clone();
                members.insert(value.to_string(), value);
                Val::unit()
            }
            (ValKind::Set(members), "remove") => {
                Val::bool(members.remove(&arg(args, 0, method)?.to_string()).is_some())
            }
            (ValKind::Buffer(bytes), "push") => {
                bytes.push(int_arg(args, 0, method)? as u8);
                Val::unit()
            }
            (ValKind::Buffer(bytes), "pop") => bytes.pop().map_or_else(Val::nil, |b| Val::int(i64::from(b))),
            (ValKind::Array(items), "clear") => {
                items.clear();
                Val::unit()
            }
            (ValKind::Map(map) | ValKind::Set(map), "clear") => {
                map.clear();
                Val::unit()
            }
            (ValKind::Buffer(bytes), "clear") => {
                bytes.clear();
                Val::unit()
            }
            (ValKind::Ref(cell), "set") => {
                cell.set(arg(args, 0, method)?.clone());
                Val::unit()
            }
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    fn call_method(&mut self, receiver: Val, method: &str, args: &[Val]) -> Result<Val> {
        if let Some(result) = self.callback_method(&receiver, method, args)? {
            return Ok(result);
        }

        let field = match &receiver.kind {
            ValKind::Struct(s) => s.field(method).cloned(),
            ValKind::Map(map) => map.get(method).cloned(),
            _ => None,
        };
        if let Some(callee) = field.filter(|f| f.as_closure().is_some()) {
            return self.call_value(&callee, args);
        }

        let type_key = match &receiver.kind {
            ValKind::Struct(s) => s.name.clone(),
            ValKind::Enum(e) => e.enum_name.clone(),
            _ => Arc::from(receiver.type_name()),
        };
        let qualified = format!("{type_key}::{method}");
        if let Some(callee) = self.rt.globals.get(&qualified).cloned() {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(receiver);
            full.extend_from_slice(args);
            return self.call_value(&callee, &full);
        }
        bail!("no method '{method}' on {}", type_key)
    }

    /// Callback-taking methods. Collections run eagerly and return arrays;
    /// iterator receivers build lazy adapters.
    fn callback_method(&mut self, receiver: &Val, method: &str, args: &[Val]) -> Result<Option<Val>> {
        if let ValKind::Iterator(it) = &receiver.kind {
            return self.iterator_method(it.clone(), method, args);
        }
        let iterable = matches!(
            receiver.kind,
            ValKind::Array(_) | ValKind::Tuple(_) | ValKind::Range(..) | ValKind::Map(_) | ValKind::Set(_) | ValKind::Str(_) | ValKind::Buffer(_)
        );
        if !iterable {
            return Ok(None);
        }
        if method == "iter" {
            return Ok(Some(Val::iterator(iter::from_value(receiver)?)));
        }
        let items: Vec<Val> = match &receiver.kind {
            ValKind::Array(items) | ValKind::Tuple(items) => items.clone(),
            ValKind::Map(_) | ValKind::Str(_) | ValKind::Buffer(_) => return Ok(None),
            _ => match method {
                "map" | "filter" | "reduce" | "each" | "for_each" | "any" | "all" | "find" => {
                    let it = iter::from_value(receiver)?;
                    iter::collect(&it, self)?
                }
                _ => return Ok(None),
            },
        };
        let result = match method {
            "map" => {
                let f = arg(args, 0, method)?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.call_value(f, &[item])?);
                }
                Val::array(out)
            }
            "filter" => {
                let f = arg(args, 0, method)?;
                let mut out = Vec::new();
                for item in items {
                    if self.call_value(f, std::slice::from_ref(&item))?.is_truthy() {
                        out.push(item);
                    }
                }
                Val::array(out)
            }
            "reduce" => {
                let f = arg(args, 0, method)?;
                let mut items = items.into_iter();
                let mut acc = match args.get(1) {
                    Some(init) => init.clone(),
                    None => items.next().unwrap_or_else(Val::nil),
                };
                for item in items {
                    acc = self.call_value(f, &[acc, item])?;
                }
                acc
            }
            "each" | "for_each" => {
                let f = arg(args, 0, method)?;
                for item in items {
                    self.call_value(f, &[item])?;
                }
                Val::unit()
            }
            "any" => {
                let f = arg(args, 0, method)?;
                let mut found = false;
                for item in items {
                    if self.call_value(f, &[item])?.is_truthy() {
                        found = true;
                        break;
                    }
                }
                Val::bool(found)
            }
            "all" => {
                let f = arg(args, 0, method)?;
                let mut every = true;
                for item in items {
                    if !self.call_value(f, &[item])?.is_truthy() {
                        every = false;
                        break;
                    }
                }
                Val::bool(every)
            }
            "find" => {
                let f = arg(args, 0, method)?;
                let mut found = Val::nil();
                for item in items {
                    if self.call_value(f, std::slice::from_ref(&item))?.is_truthy() {
                        found = item;
                        break;
                    }
                }
                found
            }
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    fn iterator_method(&mut self, it: Arc<crate::val::IteratorValue>, method: &str, args: &[Val]) -> Result<Option<Val>> {
        let count_arg = |i: usize| -> Result<usize> {
            usize::try_from(int_arg(args, i, method)?).map_err(|_| anyhow!("method '{method}' expects a non-negative count"))
        };
        let result = match method {
            "iter" => Val::iterator(it),
            "next" => it.next(self)?.unwrap_or_else(Val::nil),
            "map" => Val::iterator(iter::map(it, arg(args, 0, method)?.clone())),
            "filter" => Val::iterator(iter::filter(it, arg(args, 0, method)?.clone())),
            "take" => Val::iterator(iter::take(it, count_arg(0)?)),
            "skip" => Val::iterator(iter::skip(it, count_arg(0)?)),
            "enumerate" => Val::iterator(iter::enumerate(it)),
            "zip" => Val::iterator(iter::zip(it, iter::from_value(arg(args, 0, method)?)?)),
            "collect" | "to_array" => Val::array(iter::collect(&it, self)?),
            "count" => Val::int(iter::count(&it, self)? as i64),
            "reduce" => {
                let init = args.get(1).cloned().unwrap_or_else(Val::nil);
                iter::reduce(&it, arg(args, 0, method)?, init, self)?
            }
            "any" => Val::bool(iter::any(&it, arg(args, 0, method)?, self)?),
            "all" => Val::bool(iter::all(&it, arg(args, 0, method)?, self)?),
            "each" | "for_each" => {
                iter::for_each(&it, arg(args, 0, method)?, self)?;
                Val::unit()
            }
            _ => return Ok(None),
        };
        Ok(Some(result))
    }
}
