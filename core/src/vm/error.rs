use std::fmt;
use std::sync::Arc;

use crate::val::Val;

/// Runtime failure raised by the engine.
///
/// Carried inside `anyhow::Error`; recover it with `downcast_ref::<RuntimeError>()`.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
    /// (function, line) pairs, innermost first.
    pub trace: Vec<(Arc<str>, u32)>,
    pub kind: ErrorKind,
    /// Value of an uncaught `throw`, kept so an outer handler binds it unchanged.
    pub thrown: Option<Val>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Catchable by a registered handler.
    Runtime,
    /// Resource exhaustion; never routed to handlers.
    Fatal,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            line,
            trace: Vec::new(),
            kind: ErrorKind::Runtime,
            thrown: None,
        }
    }

    /// Error surfaced for a thrown value that found no handler.
    pub fn thrown(value: Val, line: u32) -> Self {
        let message = match value.as_str() {
            Some(text) => text.to_string(),
            None => format!("unhandled exception: {value}"),
        };
        Self {
            thrown: Some(value),
            ..Self::new(message, line)
        }
    }

    pub fn fatal(message: impl Into<String>, line: u32) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            ..Self::new(message, line)
        }
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }

    /// Multi-line report: the message followed by the stack trace.
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        for (func, line) in &self.trace {
            out.push_str(&format!("\n    at {func} (line {line})"));
        }
        out
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(f, "[line {}] {}", self.line, self.message)
        } else {
            f.write_str(&self.message)
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Resource-exhaustion messages.
pub(crate) mod fatal {
    pub const CALL_STACK: &str = "call stack overflow";
    pub const REGISTER_STACK: &str = "register stack overflow";
    pub const HANDLER_STACK: &str = "exception handler stack overflow";
    pub const DEFER_STACK: &str = "defer stack overflow";
}
