pub mod chan;
pub mod extensions;
pub mod iter;
pub mod phase;
pub mod task;

#[cfg(test)]
mod test_support;

use anyhow::{Result, anyhow, bail};
use lattice_core::module::ModuleRegistry;
use lattice_core::rt::Host;
use lattice_core::val::{NativeFn, Val, ValKind};

/// Register all stdlib modules with the given registry
pub fn register_stdlib_modules(registry: &mut ModuleRegistry) -> Result<()> {
    registry.register_module("phase", Box::new(phase::PhaseModule::new()))?;
    registry.register_module("iter", Box::new(iter::IterModule::new()))?;
    registry.register_module("chan", Box::new(chan::ChannelModule::new()))?;
    registry.register_module("task", Box::new(task::TaskModule::new()))?;
    registry.register_module("ext", Box::new(extensions::ExtensionModule::new()))?;
    Ok(())
}

/// Register global builtin functions available without import
/// - print(fmt, ...args) / println(fmt, ...args): write one formatted line to the engine output
/// - format(fmt, ...args): the formatted string
/// - panic([msg]): raise a runtime error built from the arguments
/// - assert(cond[, msg]), type_of(v), len(v), to_string(v)
pub fn register_stdlib_globals(registry: &mut ModuleRegistry) {
    let globals: [(&str, NativeFn); 8] = [
        ("print", print_fn),
        ("println", print_fn),
        ("format", format_fn),
        ("panic", panic_fn),
        ("assert", assert_fn),
        ("type_of", type_of_fn),
        ("len", len_fn),
        ("to_string", to_string_fn),
    ];
    for (name, func) in globals {
        registry.register_builtin(name, Val::native(name, func));
    }
}

/// Modules, globals and any registered extensions in one registry.
pub fn default_registry() -> Result<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();
    register_stdlib_modules(&mut registry)?;
    register_stdlib_globals(&mut registry);
    extensions::install_extensions(&mut registry);
    Ok(registry)
}

/// `{}` placeholders are filled in order; leftover arguments are appended
/// separated by spaces. Without a format string every argument is joined.
fn format_variadic(args: &[Val]) -> String {
    let Some((first, rest)) = args.split_first() else {
        return String::new();
    };
    let Some(fmt) = first.as_str() else {
        return args.iter().map(Val::to_string).collect::<Vec<_>>().join(" ");
    };

    let mut out = String::with_capacity(fmt.len() + rest.len() * 8);
    let mut pending = rest.iter();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' && chars.peek() == Some(&'}') {
            chars.next();
            match pending.next() {
                Some(arg) => out.push_str(&arg.to_string()),
                None => out.push_str("{}"),
            }
        } else {
            out.push(c);
        }
    }
    for arg in pending {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&arg.to_string());
    }
    out
}

fn print_fn(args: &[Val], host: &mut dyn Host) -> Result<Val> {
    host.print_line(&format_variadic(args))?;
    Ok(Val::nil())
}

fn format_fn(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    Ok(Val::str(format_variadic(args)))
}

fn panic_fn(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    if args.is_empty() {
        bail!("panic");
    }
    bail!("panic: {}", format_variadic(args))
}

fn assert_fn(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let cond = args.first().ok_or_else(|| anyhow!("assert() expects a condition"))?;
    if cond.is_truthy() {
        return Ok(Val::unit());
    }
    match args.get(1) {
        Some(msg) => bail!("assertion failed: {msg}"),
        None => bail!("assertion failed"),
    }
}

fn type_of_fn(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let value = args.first().ok_or_else(|| anyhow!("type_of() expects one argument"))?;
    Ok(Val::str(value.type_name()))
}

fn len_fn(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    let value = args.first().ok_or_else(|| anyhow!("len() expects one argument"))?;
    let len = match &value.kind {
        ValKind::Str(s) => s.chars().count(),
        ValKind::Array(items) | ValKind::Tuple(items) => items.len(),
        ValKind::Map(m) | ValKind::Set(m) => m.len(),
        ValKind::Buffer(bytes) => bytes.len(),
        ValKind::Range(start, end) => end.saturating_sub(*start).max(0) as usize,
        ValKind::Channel(ch) => ch.len(),
        _ => bail!("len() not supported for {}", value.type_name()),
    };
    Ok(Val::int(len as i64))
}

fn to_string_fn(args: &[Val], _host: &mut dyn Host) -> Result<Val> {
    Ok(Val::str(args.first().map(Val::to_string).unwrap_or_default()))
}
