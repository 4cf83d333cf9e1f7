//! Syntax tree for cell code.
//!
//! Function definitions are stored in namespaces, so every node derives
//! bincode's `Encode`/`Decode`.

use bincode::{Decode, Encode};

/// A compiled unit: one complete top-level statement (or a `;` separated
/// group), together with the source lines it was compiled from.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
    /// Cell line of `source[0]`.
    pub first_line: usize,
    pub source: Vec<String>,
}

impl Program {
    /// Source text of a cell line, if it belongs to this unit.
    pub fn line_text(&self, line: usize) -> Option<String> {
        line.checked_sub(self.first_line)
            .and_then(|idx| self.source.get(idx))
            .cloned()
    }

    /// Canonical text of the import statements in this unit.
    pub fn import_lines(&self) -> Vec<String> {
        self.body.iter().filter_map(Stmt::import_text).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Stmt {
    pub line: usize,
    pub kind: StmtKind,
}

impl Stmt {
    /// Whether the statement owns an indented block.
    pub fn is_compound(&self) -> bool {
        matches!(
            self.kind,
            StmtKind::If { .. } | StmtKind::While { .. } | StmtKind::For { .. } | StmtKind::Def(_)
        )
    }

    /// `import` statements rendered back to source.
    pub fn import_text(&self) -> Option<String> {
        match &self.kind {
            StmtKind::Import { module, alias } => Some(match alias {
                Some(alias) => format!("import {} as {}", module, alias),
                None => format!("import {}", module),
            }),
            StmtKind::FromImport { module, names } => {
                let names: Vec<String> = names
                    .iter()
                    .map(|(name, alias)| match alias {
                        Some(alias) => format!("{} as {}", name, alias),
                        None => name.clone(),
                    })
                    .collect();
                Some(format!("from {} import {}", module, names.join(", ")))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum StmtKind {
    Expr(Expr),
    Assign {
        targets: Vec<Target>,
        value: Expr,
    },
    AugAssign {
        target: Target,
        op: BinOp,
        value: Expr,
    },
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    For {
        target: Target,
        iter: Expr,
        body: Vec<Stmt>,
    },
    Def(FunctionDef),
    Return(Option<Expr>),
    Break,
    Continue,
    Pass,
    Global(Vec<String>),
    Del(Vec<Target>),
    Assert {
        test: Expr,
        message: Option<Expr>,
    },
    Import {
        module: String,
        alias: Option<String>,
    },
    FromImport {
        module: String,
        names: Vec<(String, Option<String>)>,
    },
}

/// A user-defined function.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    /// Cell line of the `def` header.
    pub first_line: usize,
    /// Source lines of the definition, for tracebacks.
    pub source: Vec<String>,
}

impl FunctionDef {
    pub fn line_text(&self, line: usize) -> Option<String> {
        line.checked_sub(self.first_line)
            .and_then(|idx| self.source.get(idx))
            .cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Param {
    pub name: String,
    /// Evaluated at call time.
    pub default: Option<Expr>,
}

/// Assignment target.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Target {
    Name(String),
    Index { obj: Expr, index: Expr },
    Unpack(Vec<Target>),
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Expr {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        left: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    IfElse {
        cond: Box<Expr>,
        then: Box<Expr>,
        orelse: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Attribute {
        obj: Box<Expr>,
        name: String,
    },
    Index {
        obj: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        obj: Box<Expr>,
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
}
