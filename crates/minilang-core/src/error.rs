//! Error values: a kind, a message, and an append-only trace.
//!
//! Grounded in `ml_types.h`'s `MLErrorT`/`MLErrorValueT` pair and
//! `ml_runtime.c`'s trace-appending discipline: every opcode that
//! produces an error appends a `(source, line)` frame before handing
//! control to `frame.on_error`.

use std::fmt;

/// One frame in an error's trace: the source name and line at which the
/// error passed through, outermost frame first once printed (§7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub source: String,
    pub line: u32,
}

/// The short, stable error kinds the core itself raises (§7). Additional
/// kinds may be introduced freely by scripted code; they are represented
/// as arbitrary strings and never matched structurally by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    TypeError,
    CallError,
    RangeError,
    NameError,
    MethodError,
    ValueError,
    ParseError,
    InternalError,
    Other(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::TypeError => write!(f, "TypeError"),
            ErrorKind::CallError => write!(f, "CallError"),
            ErrorKind::RangeError => write!(f, "RangeError"),
            ErrorKind::NameError => write!(f, "NameError"),
            ErrorKind::MethodError => write!(f, "MethodError"),
            ErrorKind::ValueError => write!(f, "ValueError"),
            ErrorKind::ParseError => write!(f, "ParseError"),
            ErrorKind::InternalError => write!(f, "InternalError"),
            ErrorKind::Other(s) => write!(f, "{s}"),
        }
    }
}

/// An error value: ordinary data until `catch` demotes its type, at
/// which point `caught` flips to `true` and the value may be inspected
/// without re-triggering propagation (§4.5).
#[derive(Debug, Clone)]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub message: String,
    pub trace: Vec<TraceFrame>,
    pub caught: bool,
}

impl ErrorValue {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: Vec::new(),
            caught: false,
        }
    }

    /// Append a trace frame — called by the VM's uniform error hook
    /// whenever an opcode produces an error, and again at each function
    /// return site the error propagates through.
    pub fn push_trace(&mut self, source: impl Into<String>, line: u32) {
        self.trace.push(TraceFrame {
            source: source.into(),
            line,
        });
    }

    /// The `catch` opcode's effect: converts the error's type to a
    /// non-special "caught error" so later opcodes treat it as plain
    /// data instead of re-propagating it.
    pub fn into_caught(mut self) -> Self {
        self.caught = true;
        self
    }

    /// Render the way a top-level driver prints an uncaught error:
    /// kind, message, then the trace outermost frame first (§7).
    pub fn render(&self) -> String {
        let mut out = format!("{}: {}", self.kind, self.message);
        for frame in self.trace.iter().rev() {
            out.push_str(&format!("\n  at {}:{}", frame.source, frame.line));
        }
        out
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl std::error::Error for ErrorValue {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_trace_outermost_first() {
        let mut e = ErrorValue::new(ErrorKind::ValueError, "bad input");
        e.push_trace("inner.ml", 10);
        e.push_trace("outer.ml", 2);
        let rendered = e.render();
        let outer_pos = rendered.find("outer.ml").unwrap();
        let inner_pos = rendered.find("inner.ml").unwrap();
        assert!(outer_pos < inner_pos);
    }

    #[test]
    fn catch_marks_error_as_plain_data() {
        let e = ErrorValue::new(ErrorKind::TypeError, "oops");
        assert!(!e.caught);
        let caught = e.into_caught();
        assert!(caught.caught);
    }
}
