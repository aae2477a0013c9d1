use std::fmt::{self, Write as _};

use super::{Callable, Val, ValKind};

fn write_float(f: &mut impl fmt::Write, v: f64) -> fmt::Result {
    if v.is_nan() {
        return f.write_str("nan");
    }
    if v.is_infinite() {
        return f.write_str(if v > 0.0 { "inf" } else { "-inf" });
    }
    if v.fract() == 0.0 && v.abs() < 1e15 {
        let mut buf = itoa::Buffer::new();
        return f.write_str(buf.format(v as i64));
    }
    let mut buf = ryu::Buffer::new();
    f.write_str(buf.format_finite(v))
}

fn write_seq(f: &mut fmt::Formatter<'_>, items: &[Val]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ValKind::Int(i) => {
                let mut buf = itoa::Buffer::new();
                f.write_str(buf.format(*i))
            }
            ValKind::Float(v) => write_float(f, *v),
            ValKind::Bool(b) => f.write_str(if *b { "true" } else { "false" }),
            ValKind::Str(s) => f.write_str(s),
            ValKind::Array(items) => {
                f.write_char('[')?;
                write_seq(f, items)?;
                f.write_char(']')
            }
            ValKind::Tuple(items) => {
                f.write_char('(')?;
                write_seq(f, items)?;
                if items.len() == 1 {
                    f.write_char(',')?;
                }
                f.write_char(')')
            }
            ValKind::Struct(s) => {
                write!(f, "{} {{ ", s.name)?;
                for (i, (k, v)) in s.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str(" }")
            }
            ValKind::Closure(c) => match &c.callable {
                Callable::Compiled { chunk, .. } => {
                    f.write_str("<closure|")?;
                    for (i, name) in chunk.param_names().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        f.write_str(name)?;
                    }
                    f.write_str("|>")
                }
                Callable::Native(_) | Callable::Extension(_) => write!(f, "<fn {}>", c.name),
            },
            ValKind::Unit => f.write_str("()"),
            ValKind::Nil => f.write_str("nil"),
            ValKind::Range(start, end) => write!(f, "{start}..{end}"),
            ValKind::Map(m) => {
                f.write_char('{')?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "\"{k}\": {v}")?;
                }
                f.write_char('}')
            }
            ValKind::Channel(_) => f.write_str("<Channel>"),
            ValKind::Enum(e) => {
                write!(f, "{}::{}", e.enum_name, e.variant)?;
                if !e.payload.is_empty() {
                    f.write_char('(')?;
                    write_seq(f, &e.payload)?;
                    f.write_char(')')?;
                }
                Ok(())
            }
            ValKind::Set(m) => {
                f.write_str("Set{")?;
                for (i, v) in m.values().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_char('}')
            }
            ValKind::Buffer(bytes) => write!(f, "Buffer<{} bytes>", bytes.len()),
            ValKind::Ref(cell) => write!(f, "Ref<{}>", cell.lock().type_name()),
            ValKind::Iterator(it) => match it.origin() {
                Some(origin) => write!(f, "<Iterator {origin}>"),
                None => f.write_str("<Iterator>"),
            },
        }
    }
}

impl Val {
    /// Display form used by diagnostics: strings are quoted and buffers show
    /// their leading bytes.
    pub fn repr(&self) -> String {
        match &self.kind {
            ValKind::Str(s) => format!("\"{s}\""),
            ValKind::Buffer(bytes) => {
                let mut out = format!("Buffer<{} bytes:", bytes.len());
                for b in bytes.iter().take(8) {
                    let _ = write!(out, " {b:02x}");
                }
                if bytes.len() > 8 {
                    out.push_str(" ...");
                }
                out.push('>');
                out
            }
            _ => self.to_string(),
        }
    }
}
