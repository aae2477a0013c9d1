//! Object graph traversal shared by the mark and trial-count phases.

use std::sync::Arc;

use crate::val::{Callable, Closure, IteratorValue, RefBox, Val, ValKind};
use crate::vm::{Upvalue, UpvalueRef};

/// A shared heap object: the only payloads that can form reference cycles.
#[derive(Clone)]
pub(crate) enum Node {
    Ref(Arc<RefBox>),
    Upvalue(UpvalueRef),
    Closure(Arc<Closure>),
    Iter(Arc<IteratorValue>),
}

impl Node {
    pub(crate) fn addr(&self) -> usize {
        match self {
            Node::Ref(r) => Arc::as_ptr(r) as *const () as usize,
            Node::Upvalue(u) => Arc::as_ptr(u) as *const () as usize,
            Node::Closure(c) => Arc::as_ptr(c) as *const () as usize,
            Node::Iter(i) => Arc::as_ptr(i) as *const () as usize,
        }
    }

    pub(crate) fn strong_count(&self) -> usize {
        match self {
            Node::Ref(r) => Arc::strong_count(r),
            Node::Upvalue(u) => Arc::strong_count(u),
            Node::Closure(c) => Arc::strong_count(c),
            Node::Iter(i) => Arc::strong_count(i),
        }
    }

    /// Push every node directly referenced by this one.
    pub(crate) fn children(&self, out: &mut Vec<Node>) {
        match self {
            Node::Ref(cell) => value_children(&cell.lock(), out),
            Node::Upvalue(cell) => {
                if let Upvalue::Closed(v) = &*cell.state() {
                    value_children(v, out);
                }
            }
            Node::Closure(closure) => closure_children(closure, out),
            Node::Iter(iter) => iter.trace(&mut |v| value_children(v, out)),
        }
    }
}

pub(crate) fn addr_of<T>(arc: &Arc<T>) -> usize {
    Arc::as_ptr(arc) as *const () as usize
}

fn closure_children(closure: &Closure, out: &mut Vec<Node>) {
    if let Callable::Compiled { upvalues, .. } = &closure.callable {
        out.extend(upvalues.iter().cloned().map(Node::Upvalue));
    }
}

/// Nodes reachable from `value` without passing through another node.
/// Exclusively owned compound payloads are walked recursively.
pub(crate) fn value_children(value: &Val, out: &mut Vec<Node>) {
    match &value.kind {
        ValKind::Ref(cell) => out.push(Node::Ref(cell.clone())),
        ValKind::Closure(closure) => {
            if !closure.upvalues().is_empty() {
                out.push(Node::Closure(closure.clone()));
            }
        }
        ValKind::Iterator(iter) => out.push(Node::Iter(iter.clone())),
        ValKind::Array(items) | ValKind::Tuple(items) => items.iter().for_each(|v| value_children(v, out)),
        ValKind::Struct(s) => s.fields.iter().for_each(|(_, v)| value_children(v, out)),
        ValKind::Enum(e) => e.payload.iter().for_each(|v| value_children(v, out)),
        ValKind::Map(m) | ValKind::Set(m) => m.values().for_each(|v| value_children(v, out)),
        _ => {}
    }
}
