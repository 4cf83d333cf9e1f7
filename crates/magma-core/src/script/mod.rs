//! The language executed by code cells.
//!
//! A small, dynamically typed, indentation-structured language in the style
//! of Python. Only the worker process ever runs it.
//!
//! ```text
//! source ──► lexer ──► parser ──► Program ──► Interpreter
//!               ▲                    │
//!               └──── splitter ◄─────┘  (is the buffer complete yet?)
//! ```

pub mod ast;
pub mod builtins;
pub mod error;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod splitter;
pub mod value;

pub use ast::Program;
pub use error::{ErrorKind, Frame, ScriptError, ScriptResult};
pub use interp::{BufferConsole, Console, Interpreter, RECURSION_LIMIT};
pub use splitter::{CompileError, Compiled, ScriptSplitter, StatementSplitter};
pub use value::{StoredValue, Value};
