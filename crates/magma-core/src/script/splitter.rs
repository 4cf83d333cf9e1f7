//! Incremental statement splitting.
//!
//! The executor feeds source lines into a growing buffer and asks a
//! [`StatementSplitter`] whether the buffer already forms a complete unit.

use super::ast::{Program, Stmt};
use super::parser::parse;

/// Result of compiling a buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Compiled<U> {
    /// The buffer is one complete unit.
    Complete(U),
    /// More lines are needed.
    Incomplete,
}

/// A buffer that can never become valid, whatever follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub message: String,
    /// Cell line the error is attributed to.
    pub line: usize,
}

/// Decides where one statement ends and the next begins.
pub trait StatementSplitter {
    type Unit;

    /// Compile `buffer`, whose first line is cell line `first_line`.
    fn try_compile(&self, buffer: &str, first_line: usize)
    -> Result<Compiled<Self::Unit>, CompileError>;

    /// Whether `line` continues the statement in the buffer even though it
    /// is not indented past it (`else:` after an `if` block).
    fn continues_statement(&self, _line: &str) -> bool {
        false
    }

    /// Lines that never start or end a statement on their own.
    fn is_filler(&self, line: &str) -> bool {
        line.trim().is_empty()
    }
}

/// Splitter for cell code.
///
/// A buffer holding a compound statement is only complete once it ends
/// with a blank line, so that a block is never cut short while its body is
/// still arriving.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptSplitter;

impl StatementSplitter for ScriptSplitter {
    type Unit = Program;

    fn try_compile(
        &self,
        buffer: &str,
        first_line: usize,
    ) -> Result<Compiled<Program>, CompileError> {
        match parse(buffer, first_line) {
            Err(err) if err.incomplete => Ok(Compiled::Incomplete),
            Err(err) => Err(CompileError {
                message: err.message,
                line: err.line,
            }),
            Ok(program) => {
                let compound = program.body.iter().any(Stmt::is_compound);
                let ends_blank = buffer
                    .rsplit_once('\n')
                    .is_some_and(|(_, last)| last.trim().is_empty());
                if compound && !ends_blank {
                    Ok(Compiled::Incomplete)
                } else {
                    Ok(Compiled::Complete(program))
                }
            }
        }
    }

    fn continues_statement(&self, line: &str) -> bool {
        let word: String = line
            .trim_start()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        matches!(word.as_str(), "elif" | "else")
    }

    fn is_filler(&self, line: &str) -> bool {
        let trimmed = line.trim();
        trimmed.is_empty() || trimmed.starts_with('#')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_complete(buffer: &str) -> bool {
        matches!(
            ScriptSplitter.try_compile(buffer, 1),
            Ok(Compiled::Complete(_))
        )
    }

    #[test]
    fn test_simple_statement_is_complete() {
        assert!(is_complete("x = 1"));
    }

    #[test]
    fn test_open_bracket_is_incomplete() {
        assert!(!is_complete("x = [1,"));
    }

    #[test]
    fn test_compound_needs_trailing_blank_line() {
        assert!(!is_complete("if x:\n    y = 1"));
        assert!(is_complete("if x:\n    y = 1\n"));
    }

    #[test]
    fn test_header_without_body_is_incomplete() {
        assert!(!is_complete("def f():"));
        assert!(!is_complete("def f():\n"));
    }

    #[test]
    fn test_syntax_error() {
        let err = ScriptSplitter.try_compile("x = = 1", 7).unwrap_err();
        assert_eq!(err.line, 7);
    }

    #[test]
    fn test_continuation_lines() {
        assert!(ScriptSplitter.continues_statement("else:"));
        assert!(ScriptSplitter.continues_statement("elif x > 1:"));
        assert!(!ScriptSplitter.continues_statement("elsewhere = 1"));
        assert!(ScriptSplitter.is_filler("   # note"));
    }
}
