use anyhow::{Result, anyhow};
use lattice_core::iter;
use lattice_core::module::{Module, ModuleRegistry};
use lattice_core::rt::Host;
use lattice_core::val::{IteratorValue, NativeFn, Val, ValKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Lazy iterator constructors and consumers, usable as `iter.map(it, f)` as
/// well as through the method forms.
#[derive(Debug, Default)]
pub struct IterModule;

impl IterModule {
    pub fn new() -> Self {
        Self
    }
}

impl Module for IterModule {
    fn name(&self) -> &str {
        "iter"
    }

    fn description(&self) -> &str {
        "Lazy iterator adapters"
    }

    fn register(&self, registry: &mut ModuleRegistry) -> Result<()> {
        registry.register_builtin("range", Val::native("range", range));
        registry.register_builtin("repeat", Val::native("repeat", repeat));
        for (name, value) in self.exports() {
            registry.register_builtin(&format!("{}::{}", self.name(), name), value);
        }
        Ok(())
    }

    fn exports(&self) -> HashMap<String, Val> {
        let natives: [(&str, NativeFn); 15] = [
            ("range", range),
            ("repeat", repeat),
            ("from", from),
            ("map", map),
            ("filter", filter),
            ("take", take),
            ("skip", skip),
            ("enumerate", enumerate),
            ("zip", zip),
            ("collect", collect),
            ("count", count),
            ("reduce", reduce),
            ("any", any),
            ("all", all),
            ("each", each),
        ];
        natives
            .into_iter()
            .map(|(name, func)| (name.to_string(), Val::native(name, func)))
            .collect()
    }
}

/// Iterator argument; any iterable value is adapted on the fly.
fn iter_arg(args: &[Val], func: &str) -> Result<Arc<IteratorValue>> {
    match args.first() {
        Some(Val {
            kind: ValKind::Iterator(it),
            ..
        }) => Ok(it.clone()),
        Some(other) => iter::from_value(other),
        None => Err(anyhow!("{func}() expects an iterator")),
    }
}

fn int_arg(args: &[Val], index: usize, func: &str) -> Result<i64> {
    args.get(index)
        .and_then(Val::as_int)
        .ok_or_else(|| anyhow!("{func}() expects an integer argument at position {}", index + 1))
}

fn count_arg(args: &[Val], index: usize, func: &str) -> Result<usize> {
    usize::try_from(int_arg(args, index, func)?).map_err(|_| anyhow!("{func}() expects a non-negative count"))
}

fn callable_arg<'a>(args: &'a [Val], index: usize, func: &str) -> Result<&'a Val> {
    match args.get(index) {
        Some(f) if f.as_closure().is_some() => Ok(f),
        Some(other) => Err(anyhow!("{func}() expects a function, got {}", other.type_name())),
        None => Err(anyhow!("{func}() expects a function")),
    }
}

/// range(end) | range(start, end) | range(start, end, step)
fn range(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let (start, end) = match args.len() {
        1 => (0, int_arg(args, 0, "range")?),
        _ => (int_arg(args, 0, "range")?, int_arg(args, 1, "range")?),
    };
    let step = if args.len() >= 3 { int_arg(args, 2, "range")? } else { 1 };
    Ok(Val::iterator(iter::range(start, end, step)?))
}

/// repeat(value) is endless; repeat(value, n) yields n copies.
fn repeat(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let value = args.first().cloned().ok_or_else(|| anyhow!("repeat() expects a value"))?;
    let times = match args.get(1) {
        Some(_) => Some(count_arg(args, 1, "repeat")? as u64),
        None => None,
    };
    Ok(Val::iterator(iter::repeat(value, times)))
}

fn from(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    Ok(Val::iterator(iter_arg(args, "from")?))
}

fn map(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let source = iter_arg(args, "map")?;
    Ok(Val::iterator(iter::map(source, callable_arg(args, 1, "map")?.clone())))
}

fn filter(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let source = iter_arg(args, "filter")?;
    Ok(Val::iterator(iter::filter(source, callable_arg(args, 1, "filter")?.clone())))
}

fn take(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let source = iter_arg(args, "take")?;
    Ok(Val::iterator(iter::take(source, count_arg(args, 1, "take")?)))
}

fn skip(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let source = iter_arg(args, "skip")?;
    Ok(Val::iterator(iter::skip(source, count_arg(args, 1, "skip")?)))
}

fn enumerate(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    Ok(Val::iterator(iter::enumerate(iter_arg(args, "enumerate")?)))
}

fn zip(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let left = iter_arg(args, "zip")?;
    let right = iter_arg(args.get(1..).unwrap_or_default(), "zip")?;
    Ok(Val::iterator(iter::zip(left, right)))
}

fn collect(args: &[Val], host: &mut dyn Host) -> Result<Val> {
    let source = iter_arg(args, "collect")?;
    Ok(Val::array(iter::collect(&source, host)?))
}

fn count(args: &[Val], host: &mut dyn Host) -> Result<Val> {
    let source = iter_arg(args, "count")?;
    Ok(Val::int(iter::count(&source, host)? as i64))
}

/// reduce(it, f, init)
fn reduce(args: &[Val], host: &mut dyn Host) -> Result<Val> {
    let source = iter_arg(args, "reduce")?;
    let func = callable_arg(args, 1, "reduce")?;
    let init = args.get(2).cloned().unwrap_or_else(Val::nil);
    iter::reduce(&source, func, init, host)
}

fn any(args: &[Val], host: &mut dyn Host) -> Result<Val> {
    let source = iter_arg(args, "any")?;
    Ok(Val::bool(iter::any(&source, callable_arg(args, 1, "any")?, host)?))
}

fn all(args: &[Val], host: &mut dyn Host) -> Result<Val> {
    let source = iter_arg(args, "all")?;
    Ok(Val::bool(iter::all(&source, callable_arg(args, 1, "all")?, host)?))
}

fn each(args: &[Val], host: &mut dyn Host) -> Result<Val> {
    let source = iter_arg(args, "each")?;
    iter::for_each(&source, callable_arg(args, 1, "each")?, host)?;
    Ok(Val::unit())
}
