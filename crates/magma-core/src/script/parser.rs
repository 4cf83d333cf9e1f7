//! Recursive descent parser for cell code.

use super::ast::{BinOp, CmpOp, Expr, FunctionDef, Param, Program, Stmt, StmtKind, Target, UnaryOp};
use super::lexer::{LexError, Tok, Token, tokenize};

const KEYWORDS: &[&str] = &[
    "and", "as", "assert", "break", "class", "continue", "def", "del", "elif", "else", "except",
    "finally", "for", "from", "global", "if", "import", "in", "is", "lambda", "nonlocal", "not",
    "or", "pass", "raise", "return", "try", "while", "with", "yield", "None", "True", "False",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    /// The input ended where more lines could still complete it.
    pub incomplete: bool,
}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            line: err.line,
            incomplete: err.incomplete,
        }
    }
}

type PResult<T> = Result<T, ParseError>;

/// Parse `source`, whose first line is cell line `first_line`.
pub fn parse(source: &str, first_line: usize) -> PResult<Program> {
    let tokens = tokenize(source, first_line)?;
    let source: Vec<String> = source.split('\n').map(str::to_string).collect();
    let mut parser = Parser {
        tokens,
        pos: 0,
        source,
        first_line,
        fn_depth: 0,
        loop_depth: 0,
    };

    let mut body = Vec::new();
    loop {
        match parser.peek() {
            Tok::Eof => break,
            Tok::Newline => parser.pos += 1,
            Tok::Indent => return Err(parser.error("unexpected indent")),
            _ => body.extend(parser.statement()?),
        }
    }

    Ok(Program {
        body,
        first_line,
        source: parser.source,
    })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    source: Vec<String>,
    first_line: usize,
    fn_depth: usize,
    loop_depth: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .or_else(|| self.tokens.last())
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(self.first_line)
    }

    fn prev_line(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|p| self.tokens.get(p))
            .map(|t| t.line)
            .unwrap_or(self.first_line)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            line: self.line(),
            incomplete: *self.peek() == Tok::Eof,
        }
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.is_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.is_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> PResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", op)))
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> PResult<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", kw)))
        }
    }

    fn identifier(&mut self) -> PResult<String> {
        match self.peek() {
            Tok::Name(name) if !KEYWORDS.contains(&name.as_str()) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error("invalid syntax")),
        }
    }

    fn dotted_name(&mut self) -> PResult<String> {
        let mut name = self.identifier()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.identifier()?);
        }
        Ok(name)
    }

    // ---- statements ----

    fn statement(&mut self) -> PResult<Vec<Stmt>> {
        let line = self.line();
        let kind = match self.peek() {
            Tok::Name(n) if n == "if" => self.if_stmt()?,
            Tok::Name(n) if n == "while" => self.while_stmt()?,
            Tok::Name(n) if n == "for" => self.for_stmt()?,
            Tok::Name(n) if n == "def" => self.def_stmt()?,
            Tok::Name(n) if n == "elif" || n == "else" => {
                return Err(self.error("invalid syntax"));
            }
            _ => return self.simple_statements(),
        };
        Ok(vec![Stmt { line, kind }])
    }

    fn simple_statements(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = vec![self.simple_statement()?];
        while self.eat_op(";") {
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
            stmts.push(self.simple_statement()?);
        }
        match self.peek() {
            Tok::Newline => {
                self.pos += 1;
                Ok(stmts)
            }
            Tok::Eof => Ok(stmts),
            _ => Err(self.error("invalid syntax")),
        }
    }

    fn simple_statement(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let kind = match self.peek().clone() {
            Tok::Name(n) => match n.as_str() {
                "pass" => {
                    self.pos += 1;
                    StmtKind::Pass
                }
                "break" | "continue" => {
                    if self.loop_depth == 0 {
                        return Err(self.error(format!("'{}' outside loop", n)));
                    }
                    self.pos += 1;
                    if n == "break" {
                        StmtKind::Break
                    } else {
                        StmtKind::Continue
                    }
                }
                "return" => {
                    if self.fn_depth == 0 {
                        return Err(self.error("'return' outside function"));
                    }
                    self.pos += 1;
                    if matches!(self.peek(), Tok::Newline | Tok::Eof) || self.is_op(";") {
                        StmtKind::Return(None)
                    } else {
                        StmtKind::Return(Some(self.expr_list()?))
                    }
                }
                "global" => {
                    self.pos += 1;
                    let mut names = vec![self.identifier()?];
                    while self.eat_op(",") {
                        names.push(self.identifier()?);
                    }
                    StmtKind::Global(names)
                }
                "del" => {
                    self.pos += 1;
                    let mut targets = Vec::new();
                    loop {
                        let expr = self.expr()?;
                        targets.push(self.to_target(expr)?);
                        if !self.eat_op(",") {
                            break;
                        }
                    }
                    StmtKind::Del(targets)
                }
                "assert" => {
                    self.pos += 1;
                    let test = self.expr()?;
                    let message = if self.eat_op(",") {
                        Some(self.expr()?)
                    } else {
                        None
                    };
                    StmtKind::Assert { test, message }
                }
                "import" => {
                    self.pos += 1;
                    let module = self.dotted_name()?;
                    let alias = if self.eat_keyword("as") {
                        Some(self.identifier()?)
                    } else {
                        None
                    };
                    StmtKind::Import { module, alias }
                }
                "from" => {
                    self.pos += 1;
                    let module = self.dotted_name()?;
                    self.expect_keyword("import")?;
                    let parens = self.eat_op("(");
                    let mut names = Vec::new();
                    loop {
                        let name = self.identifier()?;
                        let alias = if self.eat_keyword("as") {
                            Some(self.identifier()?)
                        } else {
                            None
                        };
                        names.push((name, alias));
                        if !self.eat_op(",") {
                            break;
                        }
                        if parens && self.is_op(")") {
                            break;
                        }
                    }
                    if parens {
                        self.expect_op(")")?;
                    }
                    StmtKind::FromImport { module, names }
                }
                _ => self.expr_statement()?,
            },
            _ => self.expr_statement()?,
        };
        Ok(Stmt { line, kind })
    }

    fn expr_statement(&mut self) -> PResult<StmtKind> {
        let first = self.expr_list()?;

        let aug = match self.peek() {
            Tok::Op("+=") => Some(BinOp::Add),
            Tok::Op("-=") => Some(BinOp::Sub),
            Tok::Op("*=") => Some(BinOp::Mul),
            Tok::Op("/=") => Some(BinOp::Div),
            Tok::Op("//=") => Some(BinOp::FloorDiv),
            Tok::Op("%=") => Some(BinOp::Mod),
            Tok::Op("**=") => Some(BinOp::Pow),
            _ => None,
        };
        if let Some(op) = aug {
            self.pos += 1;
            let target = self.to_target(first)?;
            if matches!(target, Target::Unpack(_)) {
                return Err(self.error("illegal expression for augmented assignment"));
            }
            let value = self.expr_list()?;
            return Ok(StmtKind::AugAssign { target, op, value });
        }

        if !self.is_op("=") {
            return Ok(StmtKind::Expr(first));
        }
        let mut targets = Vec::new();
        let mut value = first;
        while self.eat_op("=") {
            targets.push(self.to_target(value)?);
            value = self.expr_list()?;
        }
        Ok(StmtKind::Assign { targets, value })
    }

    fn to_target(&self, expr: Expr) -> PResult<Target> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Index { obj, index } => Ok(Target::Index {
                obj: *obj,
                index: *index,
            }),
            Expr::Tuple(items) | Expr::List(items) => Ok(Target::Unpack(
                items
                    .into_iter()
                    .map(|item| self.to_target(item))
                    .collect::<PResult<_>>()?,
            )),
            _ => Err(ParseError {
                message: "cannot assign to expression".to_string(),
                line: self.prev_line(),
                incomplete: false,
            }),
        }
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_op(":")?;
        if !matches!(self.peek(), Tok::Newline) {
            return self.simple_statements();
        }
        self.pos += 1;
        if !matches!(self.peek(), Tok::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.pos += 1;

        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Dedent => {
                    self.pos += 1;
                    break;
                }
                Tok::Eof => break,
                Tok::Newline => self.pos += 1,
                Tok::Indent => return Err(self.error("unexpected indent")),
                _ => body.extend(self.statement()?),
            }
        }
        Ok(body)
    }

    fn loop_body(&mut self) -> PResult<Vec<Stmt>> {
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        body
    }

    fn if_stmt(&mut self) -> PResult<StmtKind> {
        self.expect_keyword("if")?;
        let mut branches = Vec::new();
        let cond = self.expr()?;
        branches.push((cond, self.block()?));
        let mut orelse = Vec::new();
        loop {
            if self.eat_keyword("elif") {
                let cond = self.expr()?;
                branches.push((cond, self.block()?));
            } else if self.eat_keyword("else") {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(StmtKind::If { branches, orelse })
    }

    fn while_stmt(&mut self) -> PResult<StmtKind> {
        self.expect_keyword("while")?;
        let cond = self.expr()?;
        let body = self.loop_body()?;
        Ok(StmtKind::While { cond, body })
    }

    fn for_stmt(&mut self) -> PResult<StmtKind> {
        self.expect_keyword("for")?;
        let mut items = vec![self.or_operand()?];
        let mut tuple = false;
        while self.eat_op(",") {
            tuple = true;
            if self.is_keyword("in") {
                break;
            }
            items.push(self.or_operand()?);
        }
        let target_expr = if tuple {
            Expr::Tuple(items)
        } else {
            items.remove(0)
        };
        let target = self.to_target(target_expr)?;
        self.expect_keyword("in")?;
        let iter = self.expr_list()?;
        let body = self.loop_body()?;
        Ok(StmtKind::For { target, iter, body })
    }

    fn def_stmt(&mut self) -> PResult<StmtKind> {
        let def_line = self.line();
        self.expect_keyword("def")?;
        let name = self.identifier()?;
        self.expect_op("(")?;
        let mut params: Vec<Param> = Vec::new();
        while !self.is_op(")") {
            let param = self.identifier()?;
            if params.iter().any(|p| p.name == param) {
                return Err(self.error(format!("duplicate argument '{}' in function definition", param)));
            }
            let default = if self.eat_op("=") {
                Some(self.expr()?)
            } else {
                if params.iter().any(|p| p.default.is_some()) {
                    return Err(self.error("non-default argument follows default argument"));
                }
                None
            };
            params.push(Param {
                name: param,
                default,
            });
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.expr()?;
        }

        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
        self.fn_depth += 1;
        let body = self.block();
        self.fn_depth -= 1;
        self.loop_depth = saved_loops;
        let body = body?;

        let start = def_line.saturating_sub(self.first_line);
        let end = self
            .last_body_line(&body)
            .saturating_sub(self.first_line)
            .min(self.source.len().saturating_sub(1));
        let source = self.source.get(start..=end).map(<[String]>::to_vec).unwrap_or_default();

        Ok(StmtKind::Def(FunctionDef {
            name,
            params,
            body,
            first_line: def_line,
            source,
        }))
    }

    /// Last line covered by a block, counting trailing tokens of the final
    /// statement.
    fn last_body_line(&self, body: &[Stmt]) -> usize {
        let last_stmt = body.last().map(|s| s.line).unwrap_or(self.first_line);
        let consumed = self.tokens[..self.pos]
            .iter()
            .rev()
            .find(|t| !matches!(t.tok, Tok::Dedent | Tok::Newline | Tok::Eof))
            .map(|t| t.line)
            .unwrap_or(last_stmt);
        consumed.max(last_stmt)
    }

    // ---- expressions ----

    /// Comma separated expressions; more than one (or a trailing comma)
    /// makes a tuple.
    fn expr_list(&mut self) -> PResult<Expr> {
        let first = self.expr()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_expr_end() {
                break;
            }
            items.push(self.expr()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn at_expr_end(&self) -> bool {
        matches!(
            self.peek(),
            Tok::Newline
                | Tok::Eof
                | Tok::Op("=")
                | Tok::Op(")")
                | Tok::Op("]")
                | Tok::Op(";")
                | Tok::Op(":")
                | Tok::Op("+=")
                | Tok::Op("-=")
                | Tok::Op("*=")
                | Tok::Op("/=")
                | Tok::Op("//=")
                | Tok::Op("%=")
                | Tok::Op("**=")
        )
    }

    fn expr(&mut self) -> PResult<Expr> {
        let value = self.or_expr()?;
        if self.eat_keyword("if") {
            let cond = self.or_expr()?;
            self.expect_keyword("else")?;
            let orelse = self.expr()?;
            return Ok(Expr::IfElse {
                cond: Box::new(cond),
                then: Box::new(value),
                orelse: Box::new(orelse),
            });
        }
        Ok(value)
    }

    fn or_expr(&mut self) -> PResult<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("and") {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> PResult<Expr> {
        if self.eat_keyword("not") {
            let operand = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let left = self.arith()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op("==") => CmpOp::Eq,
                Tok::Op("!=") => CmpOp::Ne,
                Tok::Op("<") => CmpOp::Lt,
                Tok::Op("<=") => CmpOp::Le,
                Tok::Op(">") => CmpOp::Gt,
                Tok::Op(">=") => CmpOp::Ge,
                Tok::Name(n) if n == "in" => CmpOp::In,
                Tok::Name(n) if n == "not" && matches!(self.peek_at(1), Tok::Name(m) if m == "in") => {
                    self.pos += 1;
                    CmpOp::NotIn
                }
                Tok::Name(n) if n == "is" => {
                    if matches!(self.peek_at(1), Tok::Name(m) if m == "not") {
                        self.pos += 1;
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                rest,
            })
        }
    }

    /// Operand level used for `for` targets, where `in` must not be consumed.
    fn or_operand(&mut self) -> PResult<Expr> {
        self.arith()
    }

    fn arith(&mut self) -> PResult<Expr> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> PResult<Expr> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn factor(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            Tok::Op("-") => Some(UnaryOp::Neg),
            Tok::Op("+") => Some(UnaryOp::Pos),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let operand = self.factor()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.power()
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = self.postfix()?;
        if self.eat_op("**") {
            let exp = self.factor()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exp),
            });
        }
        Ok(base)
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                let (args, kwargs) = self.call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat_op("[") {
                expr = self.subscript(expr)?;
            } else if self.eat_op(".") {
                let name = self.identifier()?;
                expr = Expr::Attribute {
                    obj: Box::new(expr),
                    name,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_args(&mut self) -> PResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.is_op(")") {
            let is_kwarg = matches!(self.peek(), Tok::Name(_)) && matches!(self.peek_at(1), Tok::Op("="));
            if is_kwarg {
                let name = self.identifier()?;
                self.pos += 1;
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error(format!("keyword argument repeated: {}", name)));
                }
                kwargs.push((name, self.expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.expr()?);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn subscript(&mut self, obj: Expr) -> PResult<Expr> {
        let lower = if self.is_op(":") {
            None
        } else {
            Some(self.expr_list()?)
        };
        if !self.eat_op(":") {
            self.expect_op("]")?;
            let index = lower.ok_or_else(|| self.error("invalid syntax"))?;
            return Ok(Expr::Index {
                obj: Box::new(obj),
                index: Box::new(index),
            });
        }
        let upper = if self.is_op(":") || self.is_op("]") {
            None
        } else {
            Some(Box::new(self.expr()?))
        };
        let step = if self.eat_op(":") && !self.is_op("]") {
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        self.expect_op("]")?;
        Ok(Expr::Slice {
            obj: Box::new(obj),
            lower: lower.map(Box::new),
            upper,
            step,
        })
    }

    fn atom(&mut self) -> PResult<Expr> {
        match self.peek().clone() {
            Tok::Int(v) => {
                self.pos += 1;
                Ok(Expr::Int(v))
            }
            Tok::Float(v) => {
                self.pos += 1;
                Ok(Expr::Float(v))
            }
            Tok::Str(s) => {
                self.pos += 1;
                let mut text = s;
                while let Tok::Str(next) = self.peek() {
                    text.push_str(next);
                    self.pos += 1;
                }
                Ok(Expr::Str(text))
            }
            Tok::Name(n) => match n.as_str() {
                "None" => {
                    self.pos += 1;
                    Ok(Expr::None)
                }
                "True" => {
                    self.pos += 1;
                    Ok(Expr::Bool(true))
                }
                "False" => {
                    self.pos += 1;
                    Ok(Expr::Bool(false))
                }
                _ => Ok(Expr::Name(self.identifier()?)),
            },
            Tok::Op("(") => {
                self.pos += 1;
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let inner = self.expr_list()?;
                self.expect_op(")")?;
                Ok(inner)
            }
            Tok::Op("[") => {
                self.pos += 1;
                let mut items = Vec::new();
                while !self.is_op("]") {
                    items.push(self.expr()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Op("{") => {
                self.pos += 1;
                let mut pairs = Vec::new();
                while !self.is_op("}") {
                    let key = self.expr()?;
                    self.expect_op(":")?;
                    let value = self.expr()?;
                    pairs.push((key, value));
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("}")?;
                Ok(Expr::Dict(pairs))
            }
            _ => Err(self.error("invalid syntax")),
        }
    }
}
