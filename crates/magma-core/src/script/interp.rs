//! Tree-walking interpreter for cell code.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use super::ast::{BinOp, CmpOp, Expr, FunctionDef, Program, Stmt, StmtKind, Target, UnaryOp};
use super::builtins::{self, Builtin, Module};
use super::error::{ErrorKind, ScriptError, ScriptResult};
use super::parser::parse;
use super::value::{Number, Value, range_len};

/// Maximum depth of nested user function calls.
pub const RECURSION_LIMIT: usize = 200;

/// Destination of printed text.
pub trait Console {
    fn write_text(&mut self, text: &str);
}

/// Console that collects everything into a string.
#[derive(Debug, Default)]
pub struct BufferConsole {
    pub text: String,
}

impl Console for BufferConsole {
    fn write_text(&mut self, text: &str) {
        self.text.push_str(text);
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

#[derive(Default)]
struct Scope {
    locals: FxHashMap<String, Value>,
    declared_global: FxHashSet<String>,
}

/// Executes compiled units against a set of global bindings.
pub struct Interpreter<C: Console> {
    globals: BTreeMap<String, Value>,
    scopes: Vec<Scope>,
    /// Line currently executing in each active frame, top level first.
    lines: Vec<usize>,
    console: C,
}

impl<C: Console> Interpreter<C> {
    pub fn new(console: C) -> Self {
        Self::with_globals(BTreeMap::new(), console)
    }

    pub fn with_globals(globals: BTreeMap<String, Value>, console: C) -> Self {
        Self {
            globals,
            scopes: Vec::new(),
            lines: Vec::new(),
            console,
        }
    }

    pub fn globals(&self) -> &BTreeMap<String, Value> {
        &self.globals
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    pub fn into_console(self) -> C {
        self.console
    }

    /// Parse and run a whole source text starting at line 1.
    pub fn run_source(&mut self, source: &str) -> ScriptResult<()> {
        let program = parse(source, 1).map_err(|err| {
            let mut script_err = ScriptError::new(ErrorKind::SyntaxError, err.message);
            let text = source.split('\n').nth(err.line.saturating_sub(1)).map(str::to_string);
            script_err.push_frame(err.line, "<cell>", text);
            script_err
        })?;
        self.run(&program)
    }

    /// Run a compiled unit at top level.
    pub fn run(&mut self, program: &Program) -> ScriptResult<()> {
        self.scopes.clear();
        self.lines.clear();
        self.lines.push(program.first_line);
        let result = self.exec_block(&program.body);
        let line = self.lines.first().copied().unwrap_or(program.first_line);
        self.lines.clear();
        self.scopes.clear();
        match result {
            Ok(_) => Ok(()),
            Err(mut err) => {
                err.push_frame(line, "<cell>", program.line_text(line));
                Err(err)
            }
        }
    }

    // ---- names ----

    fn lookup(&self, name: &str) -> ScriptResult<Value> {
        if let Some(scope) = self.scopes.last()
            && !scope.declared_global.contains(name)
            && let Some(value) = scope.locals.get(name)
        {
            return Ok(value.clone());
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        if let Some(builtin) = Builtin::from_name(name) {
            return Ok(Value::Builtin(builtin));
        }
        Err(ScriptError::new(
            ErrorKind::NameError,
            format!("name '{}' is not defined", name),
        ))
    }

    fn bind(&mut self, name: &str, value: Value) {
        match self.scopes.last_mut() {
            Some(scope) if !scope.declared_global.contains(name) => {
                scope.locals.insert(name.to_string(), value);
            }
            _ => {
                self.globals.insert(name.to_string(), value);
            }
        }
    }

    fn unbind(&mut self, name: &str) -> ScriptResult<()> {
        let removed = match self.scopes.last_mut() {
            Some(scope) if !scope.declared_global.contains(name) => {
                scope.locals.remove(name).is_some()
            }
            _ => self.globals.remove(name).is_some(),
        };
        if removed {
            Ok(())
        } else {
            Err(ScriptError::new(
                ErrorKind::NameError,
                format!("name '{}' is not defined", name),
            ))
        }
    }

    fn var_mut(&mut self, name: &str) -> ScriptResult<&mut Value> {
        let local = self
            .scopes
            .last()
            .is_some_and(|s| !s.declared_global.contains(name) && s.locals.contains_key(name));
        let slot = if local {
            self.scopes.last_mut().and_then(|s| s.locals.get_mut(name))
        } else {
            self.globals.get_mut(name)
        };
        slot.ok_or_else(|| {
            ScriptError::new(
                ErrorKind::NameError,
                format!("name '{}' is not defined", name),
            )
        })
    }

    /// Resolve an expression naming a storage location to its variable and
    /// the chain of subscript keys below it.
    fn resolve_place(&mut self, expr: &Expr) -> ScriptResult<Option<(String, Vec<Value>)>> {
        match expr {
            Expr::Name(name) => Ok(Some((name.clone(), Vec::new()))),
            Expr::Index { obj, index } => {
                let Some((name, mut path)) = self.resolve_place(obj)? else {
                    return Ok(None);
                };
                path.push(self.eval(index)?);
                Ok(Some((name, path)))
            }
            _ => Ok(None),
        }
    }

    fn place_mut(&mut self, name: &str, path: &[Value]) -> ScriptResult<&mut Value> {
        let mut value = self.var_mut(name)?;
        for key in path {
            value = item_mut(value, key)?;
        }
        Ok(value)
    }

    // ---- statements ----

    fn set_line(&mut self, line: usize) {
        if let Some(current) = self.lines.last_mut() {
            *current = line;
        }
    }

    fn exec_block(&mut self, body: &[Stmt]) -> ScriptResult<Flow> {
        for stmt in body {
            match self.exec(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> ScriptResult<Flow> {
        self.set_line(stmt.line);
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AugAssign { target, op, value } => {
                let rhs = self.eval(value)?;
                match target {
                    Target::Name(name) => {
                        let current = self.lookup(name)?;
                        let result = binary_op(*op, &current, &rhs)?;
                        self.bind(name, result);
                    }
                    Target::Index { obj, index } => {
                        let place = self.resolve_place(obj)?;
                        let key = self.eval(index)?;
                        match place {
                            Some((name, path)) => {
                                let container = self.place_mut(&name, &path)?;
                                let current = get_item(container, &key)?;
                                let result = binary_op(*op, &current, &rhs)?;
                                set_item(container, key, result)?;
                            }
                            None => {
                                let container = self.eval(obj)?;
                                let current = get_item(&container, &key)?;
                                binary_op(*op, &current, &rhs)?;
                            }
                        }
                    }
                    Target::Unpack(_) => {
                        return Err(ScriptError::new(
                            ErrorKind::SyntaxError,
                            "illegal expression for augmented assignment",
                        ));
                    }
                }
            }
            StmtKind::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval(cond)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                return self.exec_block(orelse);
            }
            StmtKind::While { cond, body } => {
                while self.eval(cond)?.truthy() {
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    self.set_line(stmt.line);
                }
            }
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval(iter)?;
                for item in iterable.iter_values()? {
                    self.set_line(stmt.line);
                    self.assign(target, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::Def(def) => {
                self.bind(&def.name, Value::Function(Arc::new(def.clone())));
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
            StmtKind::Global(names) => {
                if let Some(scope) = self.scopes.last_mut() {
                    for name in names {
                        scope.locals.remove(name);
                        scope.declared_global.insert(name.clone());
                    }
                }
            }
            StmtKind::Del(targets) => {
                for target in targets {
                    self.delete(target)?;
                }
            }
            StmtKind::Assert { test, message } => {
                if !self.eval(test)?.truthy() {
                    let message = match message {
                        Some(expr) => self.eval(expr)?.display(),
                        None => String::new(),
                    };
                    return Err(ScriptError::new(ErrorKind::AssertionError, message));
                }
            }
            StmtKind::Import { module, alias } => {
                let handle = import_module(module)?;
                self.bind(alias.as_deref().unwrap_or(module), Value::Module(handle));
            }
            StmtKind::FromImport { module, names } => {
                let handle = import_module(module)?;
                for (name, alias) in names {
                    let value = handle.attr(name).ok_or_else(|| {
                        ScriptError::new(
                            ErrorKind::ImportError,
                            format!("cannot import name '{}' from '{}'", name, module),
                        )
                    })?;
                    self.bind(alias.as_deref().unwrap_or(name), value);
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn assign(&mut self, target: &Target, value: Value) -> ScriptResult<()> {
        match target {
            Target::Name(name) => {
                self.bind(name, value);
                Ok(())
            }
            Target::Index { obj, index } => match self.resolve_place(obj)? {
                Some((name, path)) => {
                    let key = self.eval(index)?;
                    let container = self.place_mut(&name, &path)?;
                    set_item(container, key, value)
                }
                None => {
                    // A temporary: the write has no visible effect.
                    let mut container = self.eval(obj)?;
                    let key = self.eval(index)?;
                    set_item(&mut container, key, value)
                }
            },
            Target::Unpack(targets) => {
                let items: Vec<Value> = value.iter_values()?.collect();
                if items.len() != targets.len() {
                    return Err(ScriptError::value_error(if items.len() > targets.len() {
                        format!("too many values to unpack (expected {})", targets.len())
                    } else {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        )
                    }));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
                Ok(())
            }
        }
    }

    fn delete(&mut self, target: &Target) -> ScriptResult<()> {
        match target {
            Target::Name(name) => self.unbind(name),
            Target::Index { obj, index } => {
                let Some((name, path)) = self.resolve_place(obj)? else {
                    return Ok(());
                };
                let key = self.eval(index)?;
                let container = self.place_mut(&name, &path)?;
                match container {
                    Value::List(items) => {
                        let idx = list_index(items.len(), &key)?;
                        items.remove(idx);
                        Ok(())
                    }
                    Value::Dict(dict) => dict
                        .remove(&key)
                        .map(|_| ())
                        .ok_or_else(|| ScriptError::new(ErrorKind::KeyError, key.repr())),
                    other => Err(ScriptError::type_error(format!(
                        "'{}' object doesn't support item deletion",
                        other.type_name()
                    ))),
                }
            }
            Target::Unpack(targets) => {
                for target in targets {
                    self.delete(target)?;
                }
                Ok(())
            }
        }
    }

    // ---- expressions ----

    fn eval(&mut self, expr: &Expr) -> ScriptResult<Value> {
        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => Ok(Value::List(self.eval_all(items)?)),
            Expr::Tuple(items) => Ok(Value::Tuple(self.eval_all(items)?)),
            Expr::Dict(pairs) => {
                let mut dict = super::value::Dict::new();
                for (k, v) in pairs {
                    let key = self.eval(k)?;
                    let value = self.eval(v)?;
                    dict.insert(key, value)?;
                }
                Ok(Value::Dict(dict))
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                unary_op(*op, &value)
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                binary_op(*op, &l, &r)
            }
            Expr::Compare { left, rest } => {
                let mut l = self.eval(left)?;
                for (op, right) in rest {
                    let r = self.eval(right)?;
                    if !compare(*op, &l, &r)? {
                        return Ok(Value::Bool(false));
                    }
                    l = r;
                }
                Ok(Value::Bool(true))
            }
            Expr::And(left, right) => {
                let l = self.eval(left)?;
                if !l.truthy() {
                    return Ok(l);
                }
                self.eval(right)
            }
            Expr::Or(left, right) => {
                let l = self.eval(left)?;
                if l.truthy() {
                    return Ok(l);
                }
                self.eval(right)
            }
            Expr::IfElse { cond, then, orelse } => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::Call { func, args, kwargs } => self.eval_call(func, args, kwargs),
            Expr::Attribute { obj, name } => match self.eval(obj)? {
                Value::Module(module) => module.attr(name).ok_or_else(|| {
                    ScriptError::new(
                        ErrorKind::AttributeError,
                        format!("module '{}' has no attribute '{}'", module.name(), name),
                    )
                }),
                other => Err(ScriptError::new(
                    ErrorKind::AttributeError,
                    format!(
                        "'{}' object attribute '{}' must be called",
                        other.type_name(),
                        name
                    ),
                )),
            },
            Expr::Index { obj, index } => {
                let container = self.eval(obj)?;
                let key = self.eval(index)?;
                get_item(&container, &key)
            }
            Expr::Slice {
                obj,
                lower,
                upper,
                step,
            } => {
                let container = self.eval(obj)?;
                let lower = self.eval_bound(lower.as_deref())?;
                let upper = self.eval_bound(upper.as_deref())?;
                let step = self.eval_bound(step.as_deref())?;
                slice(&container, lower, upper, step)
            }
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> ScriptResult<Vec<Value>> {
        exprs.iter().map(|e| self.eval(e)).collect()
    }

    fn eval_bound(&mut self, expr: Option<&Expr>) -> ScriptResult<Option<i64>> {
        match expr {
            None => Ok(None),
            Some(expr) => match self.eval(expr)? {
                Value::None => Ok(None),
                Value::Int(i) => Ok(Some(i)),
                Value::Bool(b) => Ok(Some(b as i64)),
                other => Err(ScriptError::type_error(format!(
                    "slice indices must be integers or None, not {}",
                    other.type_name()
                ))),
            },
        }
    }

    fn eval_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> ScriptResult<Value> {
        if let Expr::Attribute { obj, name } = func {
            let place = self.resolve_place(obj)?;
            let args = self.eval_all(args)?;
            let kwargs = self.eval_kwargs(kwargs)?;
            return match place {
                Some((var, path)) => {
                    let slot = self.place_mut(&var, &path)?;
                    if let Value::Module(module) = slot {
                        let module = *module;
                        return self.call_module(module, name, args, kwargs);
                    }
                    let mut receiver = std::mem::replace(slot, Value::None);
                    let result = builtins::call_method(self, &mut receiver, name, args, kwargs);
                    // The call may have rebound or removed the variable.
                    if let Ok(slot) = self.place_mut(&var, &path) {
                        *slot = receiver;
                    }
                    result
                }
                None => {
                    let mut receiver = self.eval(obj)?;
                    if let Value::Module(module) = receiver {
                        return self.call_module(module, name, args, kwargs);
                    }
                    builtins::call_method(self, &mut receiver, name, args, kwargs)
                }
            };
        }

        let callee = self.eval(func)?;
        let args = self.eval_all(args)?;
        let kwargs = self.eval_kwargs(kwargs)?;
        self.call_value(callee, args, kwargs)
    }

    fn eval_kwargs(&mut self, kwargs: &[(String, Expr)]) -> ScriptResult<Vec<(String, Value)>> {
        kwargs
            .iter()
            .map(|(k, e)| Ok((k.clone(), self.eval(e)?)))
            .collect()
    }

    fn call_module(
        &mut self,
        module: Module,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> ScriptResult<Value> {
        let callee = module.attr(name).ok_or_else(|| {
            ScriptError::new(
                ErrorKind::AttributeError,
                format!("module '{}' has no attribute '{}'", module.name(), name),
            )
        })?;
        self.call_value(callee, args, kwargs)
    }

    /// Call any callable value.
    pub fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> ScriptResult<Value> {
        match callee {
            Value::Builtin(builtin) => builtins::call(self, builtin, args, kwargs),
            Value::Function(def) => self.call_function(&def, args, kwargs),
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(
        &mut self,
        def: &FunctionDef,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> ScriptResult<Value> {
        if self.scopes.len() >= RECURSION_LIMIT {
            return Err(ScriptError::new(
                ErrorKind::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        if args.len() > def.params.len() {
            return Err(ScriptError::type_error(format!(
                "{}() takes {} positional arguments but {} were given",
                def.name,
                def.params.len(),
                args.len()
            )));
        }

        let mut bound: Vec<Option<Value>> = args.into_iter().map(Some).collect();
        bound.resize(def.params.len(), None);
        for (key, value) in kwargs {
            let idx = def.params.iter().position(|p| p.name == key).ok_or_else(|| {
                ScriptError::type_error(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    def.name, key
                ))
            })?;
            if bound[idx].is_some() {
                return Err(ScriptError::type_error(format!(
                    "{}() got multiple values for argument '{}'",
                    def.name, key
                )));
            }
            bound[idx] = Some(value);
        }

        let mut scope = Scope::default();
        for (param, value) in def.params.iter().zip(bound) {
            let value = match (value, &param.default) {
                (Some(value), _) => value,
                (None, Some(default)) => self.eval(default)?,
                (None, None) => {
                    return Err(ScriptError::type_error(format!(
                        "{}() missing required argument: '{}'",
                        def.name, param.name
                    )));
                }
            };
            scope.locals.insert(param.name.clone(), value);
        }

        self.scopes.push(scope);
        self.lines.push(def.first_line);
        let result = self.exec_block(&def.body);
        let line = self.lines.pop().unwrap_or(def.first_line);
        self.scopes.pop();

        match result {
            Ok(Flow::Return(value)) => Ok(value),
            Ok(_) => Ok(Value::None),
            Err(mut err) => {
                err.push_frame(line, &def.name, def.line_text(line));
                Err(err)
            }
        }
    }
}

fn import_module(name: &str) -> ScriptResult<Module> {
    Module::from_name(name).ok_or_else(|| {
        ScriptError::new(
            ErrorKind::ModuleNotFoundError,
            format!("No module named '{}'", name),
        )
    })
}

fn overflow() -> ScriptError {
    ScriptError::new(ErrorKind::OverflowError, "integer overflow")
}

fn zero_division(what: &str) -> ScriptError {
    ScriptError::new(ErrorKind::ZeroDivisionError, what)
}

fn unsupported(op: &str, left: &Value, right: &Value) -> ScriptError {
    ScriptError::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        left.type_name(),
        right.type_name()
    ))
}

fn unary_op(op: UnaryOp, value: &Value) -> ScriptResult<Value> {
    match (op, value.as_number()) {
        (UnaryOp::Not, _) => Ok(Value::Bool(!value.truthy())),
        (UnaryOp::Neg, Some(Number::Int(i))) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
        (UnaryOp::Neg, Some(Number::Float(f))) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Some(Number::Int(i))) => Ok(Value::Int(i)),
        (UnaryOp::Pos, Some(Number::Float(f))) => Ok(Value::Float(f)),
        (_, None) => Err(ScriptError::type_error(format!(
            "bad operand type for unary {}: '{}'",
            if op == UnaryOp::Neg { "-" } else { "+" },
            value.type_name()
        ))),
    }
}

fn repeat(items: &[Value], times: i64) -> Vec<Value> {
    let times = times.max(0) as usize;
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    out
}

/// Apply a binary arithmetic operator.
pub fn binary_op(op: BinOp, left: &Value, right: &Value) -> ScriptResult<Value> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return numeric_op(op, a, b);
    }
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            Ok(Value::List(a.iter().chain(b).cloned().collect()))
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            Ok(Value::Tuple(a.iter().chain(b).cloned().collect()))
        }
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s))
            if matches!(n, Value::Int(_) | Value::Bool(_)) =>
        {
            let times = n.as_number().map(|n| n.as_f64() as i64).unwrap_or(0);
            Ok(Value::Str(s.repeat(times.max(0) as usize)))
        }
        (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items))
            if matches!(n, Value::Int(_) | Value::Bool(_)) =>
        {
            let times = n.as_number().map(|n| n.as_f64() as i64).unwrap_or(0);
            Ok(Value::List(repeat(items, times)))
        }
        (BinOp::Mul, Value::Tuple(items), n) | (BinOp::Mul, n, Value::Tuple(items))
            if matches!(n, Value::Int(_) | Value::Bool(_)) =>
        {
            let times = n.as_number().map(|n| n.as_f64() as i64).unwrap_or(0);
            Ok(Value::Tuple(repeat(items, times)))
        }
        _ => Err(unsupported(op.symbol(), left, right)),
    }
}

fn numeric_op(op: BinOp, a: Number, b: Number) -> ScriptResult<Value> {
    if let (Number::Int(x), Number::Int(y)) = (a, b) {
        return match op {
            BinOp::Add => x.checked_add(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Sub => x.checked_sub(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Mul => x.checked_mul(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Div => {
                if y == 0 {
                    return Err(zero_division("division by zero"));
                }
                Ok(Value::Float(x as f64 / y as f64))
            }
            BinOp::FloorDiv => {
                if y == 0 {
                    return Err(zero_division("integer division or modulo by zero"));
                }
                let q = x.checked_div(y).ok_or_else(overflow)?;
                let adjust = (x % y != 0) && ((x < 0) != (y < 0));
                Ok(Value::Int(if adjust { q - 1 } else { q }))
            }
            BinOp::Mod => {
                if y == 0 {
                    return Err(zero_division("integer division or modulo by zero"));
                }
                let r = x.checked_rem(y).ok_or_else(overflow)?;
                Ok(Value::Int(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r }))
            }
            BinOp::Pow => {
                if y < 0 {
                    if x == 0 {
                        return Err(zero_division(
                            "0.0 cannot be raised to a negative power",
                        ));
                    }
                    return Ok(Value::Float((x as f64).powf(y as f64)));
                }
                let exp = u32::try_from(y).map_err(|_| overflow())?;
                x.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
            }
        };
    }

    let (x, y) = (a.as_f64(), b.as_f64());
    let value = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(zero_division("float floor division by zero"));
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(zero_division("float modulo"));
            }
            let r = x % y;
            if r != 0.0 && ((r < 0.0) != (y < 0.0)) { r + y } else { r }
        }
        BinOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(zero_division("0.0 cannot be raised to a negative power"));
            }
            x.powf(y)
        }
    };
    Ok(Value::Float(value))
}

fn contains(container: &Value, item: &Value) -> ScriptResult<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(needle.as_str())),
            other => Err(ScriptError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) | Value::Tuple(items) => Ok(items.iter().any(|v| v.py_eq(item))),
        Value::Dict(dict) => Ok(dict.contains(item)),
        Value::Range { start, step, .. } => {
            let Value::Int(i) = item else {
                return Ok(false);
            };
            let offset = (*i as i128) - (*start as i128);
            let step = *step as i128;
            let k = offset / step;
            Ok(offset % step == 0 && k >= 0 && (k as u128) < range_len(container) as u128)
        }
        other => Err(ScriptError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> ScriptResult<bool> {
    use std::cmp::Ordering::*;
    Ok(match op {
        CmpOp::Eq => left.py_eq(right),
        CmpOp::Ne => !left.py_eq(right),
        CmpOp::Is => is_same(left, right),
        CmpOp::IsNot => !is_same(left, right),
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
        CmpOp::Lt => left.py_cmp(right)? == Less,
        CmpOp::Le => left.py_cmp(right)? != Greater,
        CmpOp::Gt => left.py_cmp(right)? == Greater,
        CmpOp::Ge => left.py_cmp(right)? != Less,
    })
}

fn is_same(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Function(_), Value::Function(_))
        | (Value::Builtin(_), Value::Builtin(_))
        | (Value::Module(_), Value::Module(_))
        | (Value::File(_), Value::File(_)) => left.py_eq(right),
        _ => false,
    }
}

fn list_index(len: usize, key: &Value) -> ScriptResult<usize> {
    let index = match key {
        Value::Int(i) => *i,
        Value::Bool(b) => *b as i64,
        other => {
            return Err(ScriptError::type_error(format!(
                "indices must be integers, not {}",
                other.type_name()
            )));
        }
    };
    let signed_len = len as i64;
    let idx = if index < 0 { index + signed_len } else { index };
    if (0..signed_len).contains(&idx) {
        Ok(idx as usize)
    } else {
        Err(ScriptError::new(ErrorKind::IndexError, "index out of range"))
    }
}

fn get_item(container: &Value, key: &Value) -> ScriptResult<Value> {
    match container {
        Value::List(items) | Value::Tuple(items) => Ok(items[list_index(items.len(), key)?].clone()),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = list_index(chars.len(), key)?;
            Ok(Value::Str(chars[idx].to_string()))
        }
        Value::Dict(dict) => dict
            .get(key)
            .cloned()
            .ok_or_else(|| ScriptError::new(ErrorKind::KeyError, key.repr())),
        Value::Range { start, step, .. } => {
            let idx = list_index(range_len(container), key)? as i64;
            start
                .checked_add(idx.checked_mul(*step).ok_or_else(overflow)?)
                .map(Value::Int)
                .ok_or_else(overflow)
        }
        other => Err(ScriptError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn item_mut<'a>(container: &'a mut Value, key: &Value) -> ScriptResult<&'a mut Value> {
    match container {
        Value::List(items) => {
            let idx = list_index(items.len(), key)?;
            Ok(&mut items[idx])
        }
        Value::Dict(dict) => dict
            .get_mut(key)
            .ok_or_else(|| ScriptError::new(ErrorKind::KeyError, key.repr())),
        other => Err(ScriptError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn set_item(container: &mut Value, key: Value, value: Value) -> ScriptResult<()> {
    match container {
        Value::Dict(dict) => dict.insert(key, value),
        other => {
            *item_mut(other, &key)? = value;
            Ok(())
        }
    }
}

fn slice_indices(len: usize, lower: Option<i64>, upper: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let clamp = |bound: i64, low: i64, high: i64| {
        let bound = if bound < 0 { bound + len } else { bound };
        bound.clamp(low, high)
    };
    let mut out = Vec::new();
    if step > 0 {
        let start = lower.map(|b| clamp(b, 0, len)).unwrap_or(0);
        let stop = upper.map(|b| clamp(b, 0, len)).unwrap_or(len);
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        let start = lower.map(|b| clamp(b, -1, len - 1)).unwrap_or(len - 1);
        let stop = upper.map(|b| clamp(b, -1, len - 1)).unwrap_or(-1);
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            i += step;
        }
    }
    out
}

fn slice(
    container: &Value,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> ScriptResult<Value> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(ScriptError::value_error("slice step cannot be zero"));
    }
    match container {
        Value::List(items) => Ok(Value::List(
            slice_indices(items.len(), lower, upper, step)
                .into_iter()
                .map(|i| items[i].clone())
                .collect(),
        )),
        Value::Tuple(items) => Ok(Value::Tuple(
            slice_indices(items.len(), lower, upper, step)
                .into_iter()
                .map(|i| items[i].clone())
                .collect(),
        )),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(
                slice_indices(chars.len(), lower, upper, step)
                    .into_iter()
                    .map(|i| chars[i])
                    .collect(),
            ))
        }
        other => Err(ScriptError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> (Interpreter<BufferConsole>, ScriptResult<()>) {
        let mut interp = Interpreter::new(BufferConsole::default());
        let result = interp.run_source(source);
        (interp, result)
    }

    fn output(source: &str) -> String {
        let (interp, result) = run(source);
        result.unwrap();
        interp.into_console().text
    }

    fn error(source: &str) -> ScriptError {
        run(source).1.unwrap_err()
    }

    #[test]
    fn test_print_and_arithmetic() {
        assert_eq!(output("print(1 + 2 * 3, 7 // 2, -7 // 2, 7 % -3, 2 ** 10)"), "7 3 -4 -2 1024\n");
        assert_eq!(output("print(1 / 2, 3.0 * 2)"), "0.5 6.0\n");
        assert_eq!(output("print('a', 'b', sep='-', end='!')"), "a-b!");
    }

    #[test]
    fn test_division_by_zero() {
        let err = error("x = 1\ny = x / 0");
        assert_eq!(err.kind, ErrorKind::ZeroDivisionError);
        assert_eq!(err.frames[0].line, 2);
        assert_eq!(err.frames[0].text.as_deref(), Some("y = x / 0"));
    }

    #[test]
    fn test_overflow_is_checked() {
        assert_eq!(error("x = 9223372036854775807 + 1").kind, ErrorKind::OverflowError);
    }

    #[test]
    fn test_name_error() {
        let err = error("print(missing)");
        assert_eq!(err.kind, ErrorKind::NameError);
        assert_eq!(err.message, "name 'missing' is not defined");
    }

    #[test]
    fn test_control_flow() {
        let source = "total = 0\nfor i in range(10):\n    if i % 2 == 0:\n        continue\n    if i > 7:\n        break\n    total += i\nprint(total)\n";
        assert_eq!(output(source), "16\n");

        let source = "n = 0\nwhile True:\n    n += 1\n    if n == 3:\n        break\nprint(n)\n";
        assert_eq!(output(source), "3\n");
    }

    #[test]
    fn test_functions() {
        let source = "def add(a, b=10):\n    return a + b\nprint(add(1), add(1, 2), add(b=5, a=1))\n";
        assert_eq!(output(source), "11 3 6\n");
    }

    #[test]
    fn test_recursion() {
        let source = "def fact(n):\n    if n <= 1:\n        return 1\n    return n * fact(n - 1)\nprint(fact(10))\n";
        assert_eq!(output(source), "3628800\n");
    }

    #[test]
    fn test_recursion_limit() {
        let handle = std::thread::Builder::new()
            .stack_size(256 * 1024 * 1024)
            .spawn(|| error("def f(n):\n    return f(n + 1)\nf(0)\n"))
            .unwrap();
        let err = handle.join().unwrap();
        assert_eq!(err.kind, ErrorKind::RecursionError);
    }

    #[test]
    fn test_traceback_through_function() {
        let err = error("def f(x):\n    return 1 / x\n\nf(0)\n");
        let trace = err.traceback();
        assert_eq!(
            trace,
            vec![
                "Traceback (most recent call last):",
                "  Cell line 4, in <cell>",
                "    f(0)",
                "  Cell line 2, in f",
                "    return 1 / x",
                "ZeroDivisionError: division by zero",
            ]
        );
    }

    #[test]
    fn test_value_semantics() {
        let source = "a = [1, 2]\nb = a\nb.append(3)\nprint(a, b)\n";
        assert_eq!(output(source), "[1, 2] [1, 2, 3]\n");
    }

    #[test]
    fn test_nested_mutation() {
        let source = "d = {'xs': [1]}\nd['xs'].append(2)\nd['xs'][0] = 5\nd['n'] = 1\nd['n'] += 1\nprint(d)\n";
        assert_eq!(output(source), "{'xs': [5, 2], 'n': 2}\n");
    }

    #[test]
    fn test_global_statement() {
        let source = "count = 0\ndef bump():\n    global count\n    count += 1\nbump()\nbump()\nprint(count)\n";
        assert_eq!(output(source), "2\n");
    }

    #[test]
    fn test_locals_do_not_leak() {
        let (interp, result) = run("def f():\n    y = 1\n    return y\nf()\n");
        result.unwrap();
        assert!(interp.global("y").is_none());
        assert!(matches!(interp.global("f"), Some(Value::Function(_))));
    }

    #[test]
    fn test_del() {
        let (interp, result) = run("x = 1\nxs = [1, 2, 3]\ndel x, xs[0]\n");
        result.unwrap();
        assert!(interp.global("x").is_none());
        assert_eq!(interp.global("xs").unwrap().repr(), "[2, 3]");
    }

    #[test]
    fn test_imports() {
        let source = "import math\nfrom math import sqrt as root\nprint(math.floor(math.pi), root(16))\n";
        assert_eq!(output(source), "3 4.0\n");
        assert_eq!(error("import numpy").kind, ErrorKind::ModuleNotFoundError);
        assert_eq!(error("from math import nope").kind, ErrorKind::ImportError);
    }

    #[test]
    fn test_unpacking_and_builtins() {
        let source = "a, b = 1, 2\na, b = b, a\nfor i, (x, y) in enumerate(zip([1, 2], 'ab')):\n    print(i, x, y)\nprint(a, b, sorted([3, 1, 2], reverse=True), max([1, 5, 2]), sum(range(5)))\n";
        assert_eq!(output(source), "0 1 a\n1 2 b\n2 1 [3, 2, 1] 5 10\n");
    }

    #[test]
    fn test_sort_with_key_function() {
        let source = "def neg(x):\n    return -x\nxs = [1, 3, 2]\nxs.sort(key=neg)\nprint(xs)\n";
        assert_eq!(output(source), "[3, 2, 1]\n");
    }

    #[test]
    fn test_slicing_and_strings() {
        let source = "s = 'hello'\nprint(s[1:3], s[::-1], s[-1], [1, 2, 3, 4][1::2], 'x={}'.format(3))\n";
        assert_eq!(output(source), "el olleh o [2, 4] x=3\n");
    }

    #[test]
    fn test_comparisons() {
        let source = "print(1 < 2 < 3, 3 in [1, 2], 'b' not in 'abc', None is None, 1 == 1.0)\n";
        assert_eq!(output(source), "True False False True True\n");
    }

    #[test]
    fn test_conditional_expression_and_bool_ops() {
        assert_eq!(output("print(1 if 0 else 2, 0 or 'x', 1 and 0)"), "2 x 0\n");
    }

    #[test]
    fn test_assert() {
        let err = error("assert 1 == 2, 'nope'");
        assert_eq!(err.kind, ErrorKind::AssertionError);
        assert_eq!(err.message, "nope");
    }

    #[test]
    fn test_syntax_error_from_run_source() {
        let err = error("x = 1\ny = = 2");
        assert_eq!(err.kind, ErrorKind::SyntaxError);
        assert_eq!(err.frames[0].line, 2);
    }

    #[test]
    fn test_key_error() {
        let err = error("d = {}\nd['missing']");
        assert_eq!(err.kind, ErrorKind::KeyError);
        assert_eq!(err.message, "'missing'");
    }
}
