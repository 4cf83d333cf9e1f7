//! Errors raised by cell code, and their rendered tracebacks.

use std::fmt;

/// Name of the error, as shown on the last line of a traceback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SyntaxError,
    NameError,
    TypeError,
    ValueError,
    ZeroDivisionError,
    IndexError,
    KeyError,
    AttributeError,
    OverflowError,
    RecursionError,
    ModuleNotFoundError,
    ImportError,
    AssertionError,
    OSError,
    KeyboardInterrupt,
    WorkerExited,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One entry of the call stack at the point of failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 1-based line within the cell source.
    pub line: usize,
    /// `<cell>` for top-level code, otherwise the function name.
    pub name: String,
    /// Source text of the line, when known.
    pub text: Option<String>,
}

/// An error raised while compiling or running cell code.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    /// Innermost frame first.
    pub frames: Vec<Frame>,
}

pub type ScriptResult<T> = std::result::Result<T, ScriptError>;

impl ScriptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            frames: Vec::new(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValueError, message)
    }

    /// Record the frame the error is unwinding through.
    pub fn push_frame(&mut self, line: usize, name: &str, text: Option<String>) {
        self.frames.push(Frame {
            line,
            name: name.to_string(),
            text,
        });
    }

    /// Render the error as traceback lines, outermost frame first.
    pub fn traceback(&self) -> Vec<String> {
        let mut lines = vec!["Traceback (most recent call last):".to_string()];
        for frame in self.frames.iter().rev() {
            lines.push(format!("  Cell line {}, in {}", frame.line, frame.name));
            if let Some(text) = &frame.text {
                let text = text.trim();
                if !text.is_empty() {
                    lines.push(format!("    {}", text));
                }
            }
        }
        if self.message.is_empty() {
            lines.push(self.kind.to_string());
        } else {
            lines.push(format!("{}: {}", self.kind, self.message));
        }
        lines
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ScriptError {}
