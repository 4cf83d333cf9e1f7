//! Splitting cell source into executable units, one at a time.

use crate::script::{CompileError, Compiled, StatementSplitter};

/// Iterator over the compiled units of a cell.
///
/// Lines are appended to a buffer until the splitter reports a complete
/// unit. A unit that owns an indented block is closed by the next line at
/// the same or lower indentation (unless that line continues it) or by the
/// end of the cell. Iteration stops after the first error.
pub struct StatementLoop<'a, S: StatementSplitter> {
    splitter: &'a S,
    lines: Vec<&'a str>,
    next: usize,
    buffer: Vec<&'a str>,
    /// Cell line (1-based) of `buffer[0]`.
    buffer_start: usize,
    /// The buffer holds a fresh line that has not been compiled yet.
    pending: bool,
    finished: bool,
}

impl<'a, S: StatementSplitter> StatementLoop<'a, S> {
    pub fn new(splitter: &'a S, source: &'a str) -> Self {
        Self {
            splitter,
            lines: source.split('\n').collect(),
            next: 0,
            buffer: Vec::new(),
            buffer_start: 1,
            pending: false,
            finished: false,
        }
    }

    fn compile(&self, trailing_newline: bool) -> Result<Compiled<S::Unit>, CompileError> {
        let mut text = self.buffer.join("\n");
        if trailing_newline {
            text.push('\n');
        }
        self.splitter.try_compile(&text, self.buffer_start)
    }

    /// Compile the buffer as it stands and emit it if complete.
    fn step(&mut self) -> Option<Result<S::Unit, CompileError>> {
        match self.compile(false) {
            Ok(Compiled::Complete(unit)) => {
                self.buffer.clear();
                Some(Ok(unit))
            }
            Ok(Compiled::Incomplete) => None,
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }

    fn end_of_cell(&mut self) -> Option<Result<S::Unit, CompileError>> {
        self.finished = true;
        if self.buffer.is_empty() {
            return None;
        }
        match self.compile(true) {
            Ok(Compiled::Complete(unit)) => Some(Ok(unit)),
            Ok(Compiled::Incomplete) => Some(Err(CompileError {
                message: "unexpected end of cell".to_string(),
                line: self.buffer_start,
            })),
            Err(err) => Some(Err(err)),
        }
    }
}

impl<S: StatementSplitter> Iterator for StatementLoop<'_, S> {
    type Item = Result<S::Unit, CompileError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.pending {
                self.pending = false;
                if let Some(item) = self.step() {
                    return Some(item);
                }
                continue;
            }
            let Some(&line) = self.lines.get(self.next) else {
                return self.end_of_cell();
            };
            self.next += 1;
            let number = self.next;

            if self.buffer.is_empty() {
                if self.splitter.is_filler(line) {
                    continue;
                }
                self.buffer.push(line);
                self.buffer_start = number;
                if let Some(item) = self.step() {
                    return Some(item);
                }
                continue;
            }

            if self.splitter.is_filler(line) {
                self.buffer.push(line);
                continue;
            }

            if indent_width(line) <= indent_width(self.buffer[0])
                && !self.splitter.continues_statement(line)
            {
                match self.compile(true) {
                    Ok(Compiled::Complete(unit)) => {
                        self.buffer.clear();
                        self.buffer.push(line);
                        self.buffer_start = number;
                        self.pending = true;
                        return Some(Ok(unit));
                    }
                    Ok(Compiled::Incomplete) => {}
                    Err(err) => {
                        self.finished = true;
                        return Some(Err(err));
                    }
                }
            }

            self.buffer.push(line);
            if let Some(item) = self.step() {
                return Some(item);
            }
        }
    }
}

/// Width of the leading whitespace, tabs advancing to the next multiple of 8.
fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width = (width / 8 + 1) * 8,
            _ => break,
        }
    }
    width
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Program, ScriptSplitter};

    fn units(source: &str) -> Vec<Result<Program, CompileError>> {
        StatementLoop::new(&ScriptSplitter, source).collect()
    }

    fn first_lines(source: &str) -> Vec<usize> {
        units(source)
            .into_iter()
            .map(|u| u.expect("unit should compile").first_line)
            .collect()
    }

    #[test]
    fn test_simple_statements() {
        assert_eq!(first_lines("x = 1\nprint(x)"), vec![1, 2]);
    }

    #[test]
    fn test_leading_blank_and_comment_lines_skipped() {
        assert_eq!(first_lines("\n# setup\n\nx = 1"), vec![4]);
    }

    #[test]
    fn test_compound_closed_by_dedent() {
        let source = "for i in range(3):\n    print(i)\nx = 1";
        let units = units(source);
        assert_eq!(units.len(), 2);
        let block = units[0].as_ref().unwrap();
        assert_eq!(block.first_line, 1);
        assert_eq!(block.line_text(2).as_deref(), Some("    print(i)"));
        assert_eq!(units[1].as_ref().unwrap().first_line, 3);
    }

    #[test]
    fn test_compound_closed_by_end_of_cell() {
        assert_eq!(first_lines("if True:\n    x = 1"), vec![1]);
    }

    #[test]
    fn test_else_continues_block() {
        let source = "if x:\n    y = 1\nelse:\n    y = 2\nprint(y)";
        assert_eq!(first_lines(source), vec![1, 5]);
    }

    #[test]
    fn test_blank_line_inside_block() {
        let source = "def f():\n    a = 1\n\n    return a\nprint(f())";
        assert_eq!(first_lines(source), vec![1, 5]);
    }

    #[test]
    fn test_bracket_spanning_lines() {
        assert_eq!(first_lines("xs = [1,\n2,\n3]\nprint(xs)"), vec![1, 4]);
    }

    #[test]
    fn test_syntax_error_stops_iteration() {
        let units = units("x = 1\ny = = 2\nprint(x)");
        assert_eq!(units.len(), 2);
        assert!(units[0].is_ok());
        assert_eq!(units[1].as_ref().unwrap_err().line, 2);
    }

    #[test]
    fn test_unterminated_block_at_end() {
        let units = units("x = 1\ndef f():");
        let err = units.last().unwrap().as_ref().unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.message, "unexpected end of cell");
    }

    #[test]
    fn test_empty_source() {
        assert!(units("").is_empty());
        assert!(units("\n\n  \n").is_empty());
    }

    #[test]
    fn test_indent_width() {
        assert_eq!(indent_width("    x"), 4);
        assert_eq!(indent_width("\tx"), 8);
        assert_eq!(indent_width("  \tx"), 8);
        assert_eq!(indent_width("x"), 0);
    }
}
