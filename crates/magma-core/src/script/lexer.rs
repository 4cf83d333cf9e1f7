//! Tokenizer for cell code.
//!
//! Produces a flat token stream with explicit `Newline`, `Indent` and
//! `Dedent` tokens. Newlines inside brackets are ignored, blank and
//! comment-only lines never affect indentation.

/// Operators, longest first so that prefixes never shadow longer matches.
const OPERATORS: &[&str] = &[
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->", "(",
    ")", "[", "]", "{", "}", ",", ":", ".", ";", "+", "-", "*", "/", "%", "<", ">", "=",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub line: usize,
    /// The input ended in the middle of a construct that more lines could
    /// complete (open bracket, triple-quoted string, line continuation).
    pub incomplete: bool,
}

impl LexError {
    fn new(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line,
            incomplete: false,
        }
    }

    fn incomplete(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line,
            incomplete: true,
        }
    }
}

/// Tokenize `source`, numbering lines from `first_line`.
pub fn tokenize(source: &str, first_line: usize) -> Result<Vec<Token>, LexError> {
    Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: first_line,
        tokens: Vec::new(),
        indents: vec![0],
        brackets: Vec::new(),
    }
    .run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    tokens: Vec<Token>,
    indents: Vec<usize>,
    /// Open brackets with the line they were opened on.
    brackets: Vec<(char, usize)>,
}

impl Lexer {
    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn run(mut self) -> Result<Vec<Token>, LexError> {
        let mut at_line_start = true;

        while self.pos < self.chars.len() {
            if at_line_start && self.brackets.is_empty() {
                let mut col = 0;
                while let Some(c) = self.peek(0) {
                    match c {
                        ' ' => col += 1,
                        '\t' => col = (col / 8 + 1) * 8,
                        '\r' | '\x0c' => {}
                        _ => break,
                    }
                    self.pos += 1;
                }
                match self.peek(0) {
                    None => break,
                    Some('\n') => {
                        self.pos += 1;
                        self.line += 1;
                        continue;
                    }
                    Some('#') => {
                        self.skip_comment();
                        continue;
                    }
                    Some(_) => {}
                }
                at_line_start = false;
                self.indent_to(col)?;
            }

            let Some(c) = self.peek(0) else { break };
            match c {
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '\n' => {
                    self.pos += 1;
                    if self.brackets.is_empty() {
                        self.push(Tok::Newline);
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                '#' => self.skip_comment(),
                '\\' => match self.peek(1) {
                    Some('\n') => {
                        self.pos += 2;
                        self.line += 1;
                    }
                    Some('\r') if self.peek(2) == Some('\n') => {
                        self.pos += 3;
                        self.line += 1;
                    }
                    None => {
                        return Err(LexError::incomplete(
                            "unexpected end of cell after line continuation",
                            self.line,
                        ));
                    }
                    Some(_) => {
                        return Err(LexError::new(
                            "unexpected character after line continuation character",
                            self.line,
                        ));
                    }
                },
                '"' | '\'' => self.string(false)?,
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek(1).is_some_and(|n| n.is_ascii_digit()) => self.number()?,
                c if c.is_alphabetic() || c == '_' => {
                    let name = self.name();
                    let raw = matches!(name.as_str(), "r" | "R");
                    if raw && matches!(self.peek(0), Some('"') | Some('\'')) {
                        self.string(true)?;
                    } else {
                        self.push(Tok::Name(name));
                    }
                }
                _ => self.operator()?,
            }
        }

        if let Some(&(open, line)) = self.brackets.last() {
            return Err(LexError::incomplete(format!("'{}' was never closed", open), line));
        }
        if !at_line_start
            && self
                .tokens
                .last()
                .is_some_and(|t| t.tok != Tok::Newline)
        {
            self.push(Tok::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(self.tokens)
    }

    fn skip_comment(&mut self) {
        while self.peek(0).is_some_and(|c| c != '\n') {
            self.pos += 1;
        }
    }

    fn indent_to(&mut self, col: usize) -> Result<(), LexError> {
        let top = self.indents.last().copied().unwrap_or(0);
        if col > top {
            self.indents.push(col);
            self.push(Tok::Indent);
            return Ok(());
        }
        while col < self.indents.last().copied().unwrap_or(0) {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        if col != self.indents.last().copied().unwrap_or(0) {
            return Err(LexError::new(
                "unindent does not match any outer indentation level",
                self.line,
            ));
        }
        Ok(())
    }

    fn name(&mut self) -> String {
        let start = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn number(&mut self) -> Result<(), LexError> {
        let line = self.line;
        let radix = match (self.peek(0), self.peek(1)) {
            (Some('0'), Some('x')) | (Some('0'), Some('X')) => Some(16),
            (Some('0'), Some('o')) | (Some('0'), Some('O')) => Some(8),
            (Some('0'), Some('b')) | (Some('0'), Some('B')) => Some(2),
            _ => None,
        };
        if let Some(radix) = radix {
            self.pos += 2;
            let digits = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
            let digits: String = digits.chars().filter(|c| *c != '_').collect();
            let value = i64::from_str_radix(&digits, radix)
                .map_err(|_| LexError::new("invalid integer literal", line))?;
            self.push(Tok::Int(value));
            return Ok(());
        }

        let mut text = self.take_while(|c| c.is_ascii_digit() || c == '_');
        let mut is_float = false;
        if self.peek(0) == Some('.')
            && !self
                .peek(1)
                .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '.')
        {
            self.pos += 1;
            is_float = true;
            text.push('.');
            text.push_str(&self.take_while(|c| c.is_ascii_digit() || c == '_'));
        }
        if matches!(self.peek(0), Some('e') | Some('E')) {
            let sign = matches!(self.peek(1), Some('+') | Some('-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                text.push('e');
                self.pos += 1;
                if sign {
                    text.push(self.chars[self.pos]);
                    self.pos += 1;
                }
                text.push_str(&self.take_while(|c| c.is_ascii_digit()));
            }
        }
        if self.peek(0).is_some_and(|c| c.is_alphabetic() || c == '_') {
            return Err(LexError::new("invalid decimal literal", line));
        }

        let text: String = text.chars().filter(|c| *c != '_').collect();
        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| LexError::new("invalid float literal", line))?;
            self.push(Tok::Float(value));
        } else {
            let value = text
                .parse::<i64>()
                .map_err(|_| LexError::new("integer literal too large", line))?;
            self.push(Tok::Int(value));
        }
        Ok(())
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while self.peek(0).is_some_and(&pred) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn string(&mut self, raw: bool) -> Result<(), LexError> {
        let start_line = self.line;
        let quote = self.chars[self.pos];
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut value = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                return Err(if triple {
                    LexError::incomplete("unterminated triple-quoted string literal", start_line)
                } else {
                    LexError::new("unterminated string literal", start_line)
                });
            };
            match c {
                c if c == quote => {
                    if !triple {
                        self.pos += 1;
                        break;
                    }
                    if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                        self.pos += 3;
                        break;
                    }
                    value.push(c);
                    self.pos += 1;
                }
                '\n' => {
                    if !triple {
                        return Err(LexError::new("unterminated string literal", start_line));
                    }
                    value.push('\n');
                    self.line += 1;
                    self.pos += 1;
                }
                '\\' => {
                    self.pos += 1;
                    let Some(next) = self.peek(0) else { continue };
                    self.pos += 1;
                    if next == '\n' {
                        self.line += 1;
                        if raw {
                            value.push('\\');
                            value.push('\n');
                        }
                        continue;
                    }
                    if raw {
                        value.push('\\');
                        value.push(next);
                        continue;
                    }
                    match next {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        '0' => value.push('\0'),
                        '\\' => value.push('\\'),
                        '\'' => value.push('\''),
                        '"' => value.push('"'),
                        'x' => value.push(self.hex_escape(2, start_line)?),
                        'u' => value.push(self.hex_escape(4, start_line)?),
                        other => {
                            value.push('\\');
                            value.push(other);
                        }
                    }
                }
                c => {
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
        self.tokens.push(Token {
            tok: Tok::Str(value),
            line: start_line,
        });
        Ok(())
    }

    fn hex_escape(&mut self, len: usize, line: usize) -> Result<char, LexError> {
        let digits: String = (0..len).filter_map(|i| self.peek(i)).collect();
        let code = u32::from_str_radix(&digits, 16)
            .ok()
            .filter(|_| digits.len() == len)
            .and_then(char::from_u32)
            .ok_or_else(|| LexError::new("invalid escape sequence", line))?;
        self.pos += len;
        Ok(code)
    }

    fn operator(&mut self) -> Result<(), LexError> {
        let line = self.line;
        let op = OPERATORS
            .iter()
            .copied()
            .find(|op| {
                op.chars()
                    .enumerate()
                    .all(|(i, c)| self.peek(i) == Some(c))
            })
            .ok_or_else(|| {
                LexError::new(
                    format!("invalid character '{}'", self.chars[self.pos]),
                    line,
                )
            })?;
        self.pos += op.chars().count();

        match op {
            "(" | "[" | "{" => {
                let open = op.chars().next().unwrap_or('(');
                self.brackets.push((open, line));
            }
            ")" | "]" | "}" => {
                let expected = match op {
                    ")" => '(',
                    "]" => '[',
                    _ => '{',
                };
                match self.brackets.pop() {
                    Some((open, _)) if open == expected => {}
                    _ => return Err(LexError::new(format!("unmatched '{}'", op), line)),
                }
            }
            _ => {}
        }
        self.push(Tok::Op(op));
        Ok(())
    }
}
