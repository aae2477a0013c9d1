use std::{fmt, sync::Arc};

use anyhow::Result;

use crate::rt::Host;
use crate::vm::{Chunk, UpvalueRef};

use super::Val;

/// Host-language function. Receives the active engine through an explicit
/// context argument.
pub type NativeFn = fn(args: &[Val], host: &mut dyn Host) -> Result<Val>;

/// Function supplied by a dynamically registered extension. Extensions see
/// only their arguments.
pub type ExtensionFn = Arc<dyn Fn(&[Val]) -> Result<Val> + Send + Sync>;

/// What a closure runs when called.
#[derive(Clone)]
pub enum Callable {
    Compiled {
        chunk: Arc<Chunk>,
        upvalues: Box<[UpvalueRef]>,
        upvalue_count: usize,
    },
    Native(NativeFn),
    Extension(ExtensionFn),
}

#[derive(Clone)]
pub struct Closure {
    pub name: Arc<str>,
    pub callable: Callable,
}

impl Closure {
    pub fn compiled(chunk: Arc<Chunk>, upvalues: Vec<UpvalueRef>) -> Self {
        let upvalue_count = upvalues.len();
        Self {
            name: chunk.name.clone(),
            callable: Callable::Compiled {
                chunk,
                upvalues: upvalues.into_boxed_slice(),
                upvalue_count,
            },
        }
    }

    pub fn native(name: &str, func: NativeFn) -> Self {
        Self {
            name: Arc::from(name),
            callable: Callable::Native(func),
        }
    }

    pub fn extension(name: &str, func: ExtensionFn) -> Self {
        Self {
            name: Arc::from(name),
            callable: Callable::Extension(func),
        }
    }

    #[inline]
    pub fn is_compiled(&self) -> bool {
        matches!(self.callable, Callable::Compiled { .. })
    }

    pub fn upvalue_count(&self) -> usize {
        match &self.callable {
            Callable::Compiled { upvalue_count, .. } => *upvalue_count,
            _ => 0,
        }
    }

    pub fn upvalues(&self) -> &[UpvalueRef] {
        match &self.callable {
            Callable::Compiled { upvalues, .. } => upvalues,
            _ => &[],
        }
    }

    /// Copy of this closure whose upvalues no longer alias any frame: open
    /// cells are replaced by closed cells holding `resolve(frame, slot)`.
    pub fn detached(&self, resolve: &dyn Fn(usize, usize) -> Val) -> Closure {
        match &self.callable {
            Callable::Compiled { chunk, upvalues, .. } => {
                let cells = upvalues.iter().map(|cell| cell.detached(resolve)).collect();
                Closure::compiled(chunk.clone(), cells)
            }
            _ => self.clone(),
        }
    }
}

// Non-recursive: upvalues may point back at this closure.
impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.callable {
            Callable::Compiled { .. } => "compiled",
            Callable::Native(_) => "native",
            Callable::Extension(_) => "extension",
        };
        f.debug_struct("Closure")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("upvalues", &self.upvalue_count())
            .finish()
    }
}
