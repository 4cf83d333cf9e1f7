//! Builtin functions, the `math` and `time` modules, and methods on
//! builtin types.

use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::ast::BinOp;
use super::error::{ErrorKind, ScriptError, ScriptResult};
use super::interp::{Console, Interpreter, binary_op};
use super::value::{Dict, FileHandle, FileState, Number, Value, format_float, range_len};

type Kwargs = Vec<(String, Value)>;

/// A native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Len,
    Str,
    Int,
    Float,
    Bool,
    Range,
    List,
    Tuple,
    Dict,
    Abs,
    Min,
    Max,
    Sum,
    Round,
    Sorted,
    Repr,
    Type,
    Enumerate,
    Zip,
    Open,
    MathSqrt,
    MathFloor,
    MathCeil,
    MathPow,
    MathSin,
    MathCos,
    MathLog,
    MathFabs,
    TimeSleep,
    TimeTime,
    TimeMonotonic,
}

impl Builtin {
    /// Look up a name in the builtin scope.
    pub fn from_name(name: &str) -> Option<Builtin> {
        Some(match name {
            "print" => Builtin::Print,
            "len" => Builtin::Len,
            "str" => Builtin::Str,
            "int" => Builtin::Int,
            "float" => Builtin::Float,
            "bool" => Builtin::Bool,
            "range" => Builtin::Range,
            "list" => Builtin::List,
            "tuple" => Builtin::Tuple,
            "dict" => Builtin::Dict,
            "abs" => Builtin::Abs,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "sum" => Builtin::Sum,
            "round" => Builtin::Round,
            "sorted" => Builtin::Sorted,
            "repr" => Builtin::Repr,
            "type" => Builtin::Type,
            "enumerate" => Builtin::Enumerate,
            "zip" => Builtin::Zip,
            "open" => Builtin::Open,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Len => "len",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Bool => "bool",
            Builtin::Range => "range",
            Builtin::List => "list",
            Builtin::Tuple => "tuple",
            Builtin::Dict => "dict",
            Builtin::Abs => "abs",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Sum => "sum",
            Builtin::Round => "round",
            Builtin::Sorted => "sorted",
            Builtin::Repr => "repr",
            Builtin::Type => "type",
            Builtin::Enumerate => "enumerate",
            Builtin::Zip => "zip",
            Builtin::Open => "open",
            Builtin::MathSqrt => "sqrt",
            Builtin::MathFloor => "floor",
            Builtin::MathCeil => "ceil",
            Builtin::MathPow => "pow",
            Builtin::MathSin => "sin",
            Builtin::MathCos => "cos",
            Builtin::MathLog => "log",
            Builtin::MathFabs => "fabs",
            Builtin::TimeSleep => "sleep",
            Builtin::TimeTime => "time",
            Builtin::TimeMonotonic => "monotonic",
        }
    }
}

/// An importable native module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    Math,
    Time,
}

impl Module {
    pub fn from_name(name: &str) -> Option<Module> {
        match name {
            "math" => Some(Module::Math),
            "time" => Some(Module::Time),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Module::Math => "math",
            Module::Time => "time",
        }
    }

    pub fn attr(self, name: &str) -> Option<Value> {
        let builtin = match (self, name) {
            (Module::Math, "pi") => return Some(Value::Float(std::f64::consts::PI)),
            (Module::Math, "e") => return Some(Value::Float(std::f64::consts::E)),
            (Module::Math, "sqrt") => Builtin::MathSqrt,
            (Module::Math, "floor") => Builtin::MathFloor,
            (Module::Math, "ceil") => Builtin::MathCeil,
            (Module::Math, "pow") => Builtin::MathPow,
            (Module::Math, "sin") => Builtin::MathSin,
            (Module::Math, "cos") => Builtin::MathCos,
            (Module::Math, "log") => Builtin::MathLog,
            (Module::Math, "fabs") => Builtin::MathFabs,
            (Module::Time, "sleep") => Builtin::TimeSleep,
            (Module::Time, "time") => Builtin::TimeTime,
            (Module::Time, "monotonic") => Builtin::TimeMonotonic,
            _ => return None,
        };
        Some(Value::Builtin(builtin))
    }
}

// ---- argument helpers ----

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> ScriptResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("exactly {}", min)
        } else if args.len() < min {
            format!("at least {}", min)
        } else {
            format!("at most {}", max)
        };
        return Err(ScriptError::type_error(format!(
            "{}() takes {} argument{} ({} given)",
            name,
            expected,
            if min == max && min == 1 { "" } else { "s" },
            args.len()
        )));
    }
    Ok(())
}

fn pop_kwarg(kwargs: &mut Kwargs, key: &str) -> Option<Value> {
    let idx = kwargs.iter().position(|(k, _)| k == key)?;
    Some(kwargs.remove(idx).1)
}

fn no_kwargs(name: &str, kwargs: &Kwargs) -> ScriptResult<()> {
    match kwargs.first() {
        Some((key, _)) => Err(ScriptError::type_error(format!(
            "{}() got an unexpected keyword argument '{}'",
            name, key
        ))),
        None => Ok(()),
    }
}

fn to_int(value: &Value) -> ScriptResult<i64> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(*b as i64),
        other => Err(ScriptError::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            other.type_name()
        ))),
    }
}

fn to_f64(value: &Value) -> ScriptResult<f64> {
    value
        .as_number()
        .map(Number::as_f64)
        .ok_or_else(|| {
            ScriptError::type_error(format!("must be real number, not {}", value.type_name()))
        })
}

fn to_str<'a>(value: &'a Value, what: &str) -> ScriptResult<&'a str> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(ScriptError::type_error(format!(
            "{} must be str, not {}",
            what,
            other.type_name()
        ))),
    }
}

fn float_to_int(f: f64) -> ScriptResult<i64> {
    if f.is_nan() {
        return Err(ScriptError::value_error("cannot convert float NaN to integer"));
    }
    if !f.is_finite() || f >= 9.223_372_036_854_776e18 || f < -9.223_372_036_854_776e18 {
        return Err(ScriptError::new(
            ErrorKind::OverflowError,
            "cannot convert float to integer",
        ));
    }
    Ok(f as i64)
}

fn math_domain() -> ScriptError {
    ScriptError::value_error("math domain error")
}

fn collect(value: Value) -> ScriptResult<Vec<Value>> {
    Ok(value.iter_values()?.collect())
}

/// Sort values, optionally by a key function, keeping equal items stable.
pub(crate) fn sort_values<C: Console>(
    interp: &mut Interpreter<C>,
    items: Vec<Value>,
    key: Option<Value>,
    reverse: bool,
) -> ScriptResult<Vec<Value>> {
    let mut keyed = Vec::with_capacity(items.len());
    for item in items {
        let k = match &key {
            Some(Value::None) | None => item.clone(),
            Some(f) => interp.call_value(f.clone(), vec![item.clone()], Vec::new())?,
        };
        keyed.push((k, item));
    }

    let mut failure = None;
    keyed.sort_by(|(a, _), (b, _)| {
        let ordering = if reverse { b.py_cmp(a) } else { a.py_cmp(b) };
        ordering.unwrap_or_else(|e| {
            failure.get_or_insert(e);
            Ordering::Equal
        })
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(keyed.into_iter().map(|(_, v)| v).collect()),
    }
}

fn extreme<C: Console>(
    interp: &mut Interpreter<C>,
    builtin: Builtin,
    args: Vec<Value>,
    mut kwargs: Kwargs,
) -> ScriptResult<Value> {
    let name = builtin.name();
    let key = pop_kwarg(&mut kwargs, "key");
    no_kwargs(name, &kwargs)?;
    arity(name, &args, 1, usize::MAX)?;
    let items = if args.len() == 1 {
        collect(args.into_iter().next().unwrap_or(Value::None))?
    } else {
        args
    };

    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let k = match &key {
            Some(Value::None) | None => item.clone(),
            Some(f) => interp.call_value(f.clone(), vec![item.clone()], Vec::new())?,
        };
        let replace = match &best {
            None => true,
            Some((best_key, _)) => {
                let ord = k.py_cmp(best_key)?;
                if builtin == Builtin::Min {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                }
            }
        };
        if replace {
            best = Some((k, item));
        }
    }
    best.map(|(_, v)| v)
        .ok_or_else(|| ScriptError::value_error(format!("{}() arg is an empty sequence", name)))
}

/// Call a builtin function.
pub fn call<C: Console>(
    interp: &mut Interpreter<C>,
    builtin: Builtin,
    args: Vec<Value>,
    mut kwargs: Kwargs,
) -> ScriptResult<Value> {
    let name = builtin.name();
    match builtin {
        Builtin::Print => {
            let sep = match pop_kwarg(&mut kwargs, "sep") {
                None | Some(Value::None) => " ".to_string(),
                Some(v) => to_str(&v, "sep")?.to_string(),
            };
            let end = match pop_kwarg(&mut kwargs, "end") {
                None | Some(Value::None) => "\n".to_string(),
                Some(v) => to_str(&v, "end")?.to_string(),
            };
            no_kwargs(name, &kwargs)?;
            let mut text = args
                .iter()
                .map(Value::display)
                .collect::<Vec<_>>()
                .join(&sep);
            text.push_str(&end);
            interp.console_mut().write_text(&text);
            Ok(Value::None)
        }
        Builtin::Len => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let len = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(items) | Value::Tuple(items) => items.len(),
                Value::Dict(dict) => dict.len(),
                range @ Value::Range { .. } => range_len(range),
                other => {
                    return Err(ScriptError::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )));
                }
            };
            Ok(Value::Int(len as i64))
        }
        Builtin::Str => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            Ok(Value::Str(args.first().map(Value::display).unwrap_or_default()))
        }
        Builtin::Repr => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            Ok(Value::Str(args[0].repr()))
        }
        Builtin::Type => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            Ok(Value::Str(format!("<class '{}'>", args[0].type_name())))
        }
        Builtin::Int => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Int(0)),
                Some(Value::Int(i)) => Ok(Value::Int(*i)),
                Some(Value::Bool(b)) => Ok(Value::Int(*b as i64)),
                Some(Value::Float(f)) => Ok(Value::Int(float_to_int(f.trunc())?)),
                Some(Value::Str(s)) => s
                    .trim()
                    .replace('_', "")
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| {
                        ScriptError::value_error(format!(
                            "invalid literal for int() with base 10: {}",
                            Value::Str(s.clone()).repr()
                        ))
                    }),
                Some(other) => Err(ScriptError::type_error(format!(
                    "int() argument must be a string or a number, not '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::Float => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => {
                    let text = s.trim().to_ascii_lowercase();
                    let parsed = match text.as_str() {
                        "inf" | "+inf" | "infinity" => Ok(f64::INFINITY),
                        "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
                        "nan" => Ok(f64::NAN),
                        _ => text.parse::<f64>(),
                    };
                    parsed.map(Value::Float).map_err(|_| {
                        ScriptError::value_error(format!(
                            "could not convert string to float: {}",
                            Value::Str(s.clone()).repr()
                        ))
                    })
                }
                Some(other) => Ok(Value::Float(to_f64(other)?)),
            }
        }
        Builtin::Bool => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
        }
        Builtin::Range => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 3)?;
            let ints = args.iter().map(to_int).collect::<ScriptResult<Vec<_>>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => unreachable!("arity checked"),
            };
            if step == 0 {
                return Err(ScriptError::value_error("range() arg 3 must not be zero"));
            }
            Ok(Value::Range { start, stop, step })
        }
        Builtin::List | Builtin::Tuple => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            let items = match args.into_iter().next() {
                Some(iterable) => collect(iterable)?,
                None => Vec::new(),
            };
            Ok(if builtin == Builtin::List {
                Value::List(items)
            } else {
                Value::Tuple(items)
            })
        }
        Builtin::Dict => {
            arity(name, &args, 0, 1)?;
            let mut dict = match args.into_iter().next() {
                Some(Value::Dict(dict)) => dict,
                Some(iterable) => {
                    let mut dict = Dict::new();
                    for pair in iterable.iter_values()? {
                        let items = collect(pair)?;
                        let [key, value]: [Value; 2] = items.try_into().map_err(|_| {
                            ScriptError::value_error(
                                "dictionary update sequence element has wrong length",
                            )
                        })?;
                        dict.insert(key, value)?;
                    }
                    dict
                }
                None => Dict::new(),
            };
            for (key, value) in kwargs {
                dict.insert(Value::Str(key), value)?;
            }
            Ok(Value::Dict(dict))
        }
        Builtin::Abs => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            match args[0].as_number() {
                Some(Number::Int(i)) => i.checked_abs().map(Value::Int).ok_or_else(|| {
                    ScriptError::new(ErrorKind::OverflowError, "integer overflow")
                }),
                Some(Number::Float(f)) => Ok(Value::Float(f.abs())),
                None => Err(ScriptError::type_error(format!(
                    "bad operand type for abs(): '{}'",
                    args[0].type_name()
                ))),
            }
        }
        Builtin::Min | Builtin::Max => extreme(interp, builtin, args, kwargs),
        Builtin::Sum => {
            let start = pop_kwarg(&mut kwargs, "start");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let mut args = args.into_iter();
            let iterable = args.next().unwrap_or(Value::None);
            let mut total = args.next().or(start).unwrap_or(Value::Int(0));
            if matches!(total, Value::Str(_)) {
                return Err(ScriptError::type_error(
                    "sum() can't sum strings [use ''.join(seq) instead]",
                ));
            }
            for item in iterable.iter_values()? {
                total = binary_op(BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        Builtin::Round => {
            let ndigits = pop_kwarg(&mut kwargs, "ndigits");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let ndigits = match args.get(1).cloned().or(ndigits) {
                None | Some(Value::None) => None,
                Some(v) => Some(to_int(&v)?),
            };
            match (args[0].as_number(), ndigits) {
                (Some(Number::Int(i)), _) => Ok(Value::Int(i)),
                (Some(Number::Float(f)), None) => Ok(Value::Int(float_to_int(f.round_ties_even())?)),
                (Some(Number::Float(f)), Some(n)) => {
                    let scale = 10f64.powi(n.clamp(-308, 308) as i32);
                    Ok(Value::Float((f * scale).round_ties_even() / scale))
                }
                (None, _) => Err(ScriptError::type_error(format!(
                    "type {} doesn't define __round__ method",
                    args[0].type_name()
                ))),
            }
        }
        Builtin::Sorted => {
            let key = pop_kwarg(&mut kwargs, "key");
            let reverse = pop_kwarg(&mut kwargs, "reverse").is_some_and(|v| v.truthy());
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 1)?;
            let items = collect(args.into_iter().next().unwrap_or(Value::None))?;
            Ok(Value::List(sort_values(interp, items, key, reverse)?))
        }
        Builtin::Enumerate => {
            let start = pop_kwarg(&mut kwargs, "start");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let mut args = args.into_iter();
            let iterable = args.next().unwrap_or(Value::None);
            let mut index = match args.next().or(start) {
                Some(v) => to_int(&v)?,
                None => 0,
            };
            let mut pairs = Vec::new();
            for item in iterable.iter_values()? {
                pairs.push(Value::Tuple(vec![Value::Int(index), item]));
                index += 1;
            }
            Ok(Value::List(pairs))
        }
        Builtin::Zip => {
            no_kwargs(name, &kwargs)?;
            let columns = args
                .into_iter()
                .map(collect)
                .collect::<ScriptResult<Vec<_>>>()?;
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            let rows = (0..len)
                .map(|i| Value::Tuple(columns.iter().map(|c| c[i].clone()).collect()))
                .collect();
            Ok(Value::List(rows))
        }
        Builtin::Open => {
            let mode = pop_kwarg(&mut kwargs, "mode");
            pop_kwarg(&mut kwargs, "encoding");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let path = to_str(&args[0], "file")?.to_string();
            let mode = match args.get(1).cloned().or(mode) {
                Some(v) => to_str(&v, "mode")?.to_string(),
                None => "r".to_string(),
            };
            open_file(path, &mode)
        }
        Builtin::MathSqrt => {
            arity(name, &args, 1, 1)?;
            let x = to_f64(&args[0])?;
            if x < 0.0 {
                return Err(math_domain());
            }
            Ok(Value::Float(x.sqrt()))
        }
        Builtin::MathFloor | Builtin::MathCeil => {
            arity(name, &args, 1, 1)?;
            if let Value::Int(i) = args[0] {
                return Ok(Value::Int(i));
            }
            let x = to_f64(&args[0])?;
            let rounded = if builtin == Builtin::MathFloor {
                x.floor()
            } else {
                x.ceil()
            };
            Ok(Value::Int(float_to_int(rounded)?))
        }
        Builtin::MathPow => {
            arity(name, &args, 2, 2)?;
            Ok(Value::Float(to_f64(&args[0])?.powf(to_f64(&args[1])?)))
        }
        Builtin::MathSin => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Float(to_f64(&args[0])?.sin()))
        }
        Builtin::MathCos => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Float(to_f64(&args[0])?.cos()))
        }
        Builtin::MathLog => {
            arity(name, &args, 1, 2)?;
            let x = to_f64(&args[0])?;
            if x <= 0.0 {
                return Err(math_domain());
            }
            match args.get(1) {
                Some(base) => {
                    let base = to_f64(base)?;
                    if base <= 0.0 || base == 1.0 {
                        return Err(math_domain());
                    }
                    Ok(Value::Float(x.ln() / base.ln()))
                }
                None => Ok(Value::Float(x.ln())),
            }
        }
        Builtin::MathFabs => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Float(to_f64(&args[0])?.abs()))
        }
        Builtin::TimeSleep => {
            arity(name, &args, 1, 1)?;
            let secs = to_f64(&args[0])?;
            if secs.is_nan() || secs < 0.0 {
                return Err(ScriptError::value_error("sleep length must be non-negative"));
            }
            std::thread::sleep(Duration::try_from_secs_f64(secs).map_err(|_| {
                ScriptError::new(ErrorKind::OverflowError, "sleep length is too large")
            })?);
            Ok(Value::None)
        }
        Builtin::TimeTime => {
            arity(name, &args, 0, 0)?;
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            Ok(Value::Float(now))
        }
        Builtin::TimeMonotonic => {
            arity(name, &args, 0, 0)?;
            static ORIGIN: OnceLock<Instant> = OnceLock::new();
            let origin = ORIGIN.get_or_init(Instant::now);
            Ok(Value::Float(origin.elapsed().as_secs_f64()))
        }
    }
}

// ---- files ----

fn os_error(err: std::io::Error, path: &str) -> ScriptError {
    ScriptError::new(ErrorKind::OSError, format!("{}: '{}'", err, path))
}

fn open_file(path: String, mode: &str) -> ScriptResult<Value> {
    let mode = mode.replace('t', "");
    let state = match mode.as_str() {
        "r" => FileState::Reader(BufReader::new(
            File::open(&path).map_err(|e| os_error(e, &path))?,
        )),
        "w" | "a" => {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(mode == "w")
                .append(mode == "a")
                .open(&path)
                .map_err(|e| os_error(e, &path))?;
            FileState::Writer(BufWriter::new(file))
        }
        other => {
            return Err(ScriptError::value_error(format!("invalid mode: '{}'", other)));
        }
    };
    Ok(Value::File(FileHandle::new(path, state)))
}

fn closed_file() -> ScriptError {
    ScriptError::value_error("I/O operation on closed file.")
}

fn not_readable() -> ScriptError {
    ScriptError::new(ErrorKind::OSError, "not readable")
}

/// Read the remaining lines of a file, newlines kept.
pub(crate) fn file_lines(handle: &FileHandle) -> ScriptResult<Vec<Value>> {
    let mut state = handle
        .state
        .lock()
        .map_err(|_| ScriptError::new(ErrorKind::OSError, "file handle poisoned"))?;
    match &mut *state {
        FileState::Reader(reader) => {
            let mut lines = Vec::new();
            loop {
                let mut line = String::new();
                let n = reader
                    .read_line(&mut line)
                    .map_err(|e| os_error(e, &handle.path))?;
                if n == 0 {
                    break;
                }
                lines.push(Value::Str(line));
            }
            Ok(lines)
        }
        FileState::Writer(_) => Err(not_readable()),
        FileState::Closed => Err(closed_file()),
    }
}

fn file_method(
    handle: &FileHandle,
    method: &str,
    args: Vec<Value>,
) -> ScriptResult<Value> {
    if method == "readlines" {
        arity(method, &args, 0, 0)?;
        return Ok(Value::List(file_lines(handle)?));
    }
    let mut state = handle
        .state
        .lock()
        .map_err(|_| ScriptError::new(ErrorKind::OSError, "file handle poisoned"))?;
    match (method, &mut *state) {
        ("close", state) => {
            arity(method, &args, 0, 0)?;
            if let FileState::Writer(writer) = state {
                writer.flush().map_err(|e| os_error(e, &handle.path))?;
            }
            *state = FileState::Closed;
            Ok(Value::None)
        }
        (_, FileState::Closed) => Err(closed_file()),
        ("read", FileState::Reader(reader)) => {
            arity(method, &args, 0, 0)?;
            let mut text = String::new();
            reader
                .read_to_string(&mut text)
                .map_err(|e| os_error(e, &handle.path))?;
            Ok(Value::Str(text))
        }
        ("readline", FileState::Reader(reader)) => {
            arity(method, &args, 0, 0)?;
            let mut line = String::new();
            reader
                .read_line(&mut line)
                .map_err(|e| os_error(e, &handle.path))?;
            Ok(Value::Str(line))
        }
        ("read" | "readline", FileState::Writer(_)) => Err(not_readable()),
        ("write", FileState::Writer(writer)) => {
            arity(method, &args, 1, 1)?;
            let text = to_str(&args[0], "write() argument")?;
            writer
                .write_all(text.as_bytes())
                .map_err(|e| os_error(e, &handle.path))?;
            Ok(Value::Int(text.chars().count() as i64))
        }
        ("flush", FileState::Writer(writer)) => {
            writer.flush().map_err(|e| os_error(e, &handle.path))?;
            Ok(Value::None)
        }
        ("write" | "flush", FileState::Reader(_)) => {
            Err(ScriptError::new(ErrorKind::OSError, "not writable"))
        }
        _ => Err(no_attribute("TextIOWrapper", method)),
    }
}

// ---- methods ----

fn no_attribute(type_name: &str, name: &str) -> ScriptError {
    ScriptError::new(
        ErrorKind::AttributeError,
        format!("'{}' object has no attribute '{}'", type_name, name),
    )
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if index < 0 { index + len } else { index };
    (0..len).contains(&idx).then_some(idx as usize)
}

/// Call a method on `receiver`, which may be mutated in place.
pub fn call_method<C: Console>(
    interp: &mut Interpreter<C>,
    receiver: &mut Value,
    method: &str,
    args: Vec<Value>,
    mut kwargs: Kwargs,
) -> ScriptResult<Value> {
    if let Value::List(items) = receiver
        && method == "sort"
    {
        let key = pop_kwarg(&mut kwargs, "key");
        let reverse = pop_kwarg(&mut kwargs, "reverse").is_some_and(|v| v.truthy());
        no_kwargs(method, &kwargs)?;
        arity(method, &args, 0, 0)?;
        let taken = std::mem::take(items);
        let sorted = sort_values(interp, taken.clone(), key, reverse);
        return match sorted {
            Ok(sorted) => {
                *items = sorted;
                Ok(Value::None)
            }
            Err(err) => {
                *items = taken;
                Err(err)
            }
        };
    }

    if let Value::Str(s) = receiver
        && method == "format"
    {
        return Ok(Value::Str(format_str(s, &args, &kwargs)?));
    }
    no_kwargs(method, &kwargs)?;

    match receiver {
        Value::Str(s) => str_method(s, method, args),
        Value::List(items) => list_method(items, method, args),
        Value::Tuple(items) => match method {
            "index" | "count" => list_method(items, method, args),
            _ => Err(no_attribute("tuple", method)),
        },
        Value::Dict(dict) => dict_method(dict, method, args),
        Value::File(handle) => file_method(handle, method, args),
        other => Err(no_attribute(other.type_name(), method)),
    }
}

fn str_method(s: &str, method: &str, args: Vec<Value>) -> ScriptResult<Value> {
    let text = |v: String| Ok(Value::Str(v));
    match method {
        "upper" => text(s.to_uppercase()),
        "lower" => text(s.to_lowercase()),
        "strip" | "lstrip" | "rstrip" => {
            arity(method, &args, 0, 1)?;
            let chars: Option<Vec<char>> = match args.first() {
                None | Some(Value::None) => None,
                Some(v) => Some(to_str(v, "chars")?.chars().collect()),
            };
            let matches = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            text(match method {
                "strip" => s.trim_matches(matches).to_string(),
                "lstrip" => s.trim_start_matches(matches).to_string(),
                _ => s.trim_end_matches(matches).to_string(),
            })
        }
        "split" => {
            arity(method, &args, 0, 1)?;
            let parts: Vec<Value> = match args.first() {
                None | Some(Value::None) => s
                    .split_whitespace()
                    .map(|p| Value::Str(p.to_string()))
                    .collect(),
                Some(sep) => {
                    let sep = to_str(sep, "separator")?;
                    if sep.is_empty() {
                        return Err(ScriptError::value_error("empty separator"));
                    }
                    s.split(sep).map(|p| Value::Str(p.to_string())).collect()
                }
            };
            Ok(Value::List(parts))
        }
        "splitlines" => Ok(Value::List(
            s.lines().map(|l| Value::Str(l.to_string())).collect(),
        )),
        "join" => {
            arity(method, &args, 1, 1)?;
            let items = collect(args.into_iter().next().unwrap_or(Value::None))?;
            let parts = items
                .iter()
                .map(|item| match item {
                    Value::Str(part) => Ok(part.as_str()),
                    other => Err(ScriptError::type_error(format!(
                        "sequence item: expected str instance, {} found",
                        other.type_name()
                    ))),
                })
                .collect::<ScriptResult<Vec<_>>>()?;
            text(parts.join(s))
        }
        "replace" => {
            arity(method, &args, 2, 2)?;
            text(s.replace(to_str(&args[0], "old")?, to_str(&args[1], "new")?))
        }
        "startswith" | "endswith" => {
            arity(method, &args, 1, 1)?;
            let affix = to_str(&args[0], method)?;
            Ok(Value::Bool(if method == "startswith" {
                s.starts_with(affix)
            } else {
                s.ends_with(affix)
            }))
        }
        "find" => {
            arity(method, &args, 1, 1)?;
            let needle = to_str(&args[0], "sub")?;
            Ok(Value::Int(match s.find(needle) {
                Some(byte) => s[..byte].chars().count() as i64,
                None => -1,
            }))
        }
        "count" => {
            arity(method, &args, 1, 1)?;
            let needle = to_str(&args[0], "sub")?;
            let count = if needle.is_empty() {
                s.chars().count() + 1
            } else {
                s.matches(needle).count()
            };
            Ok(Value::Int(count as i64))
        }
        "isdigit" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
        )),
        _ => Err(no_attribute("str", method)),
    }
}

fn list_method(items: &mut Vec<Value>, method: &str, args: Vec<Value>) -> ScriptResult<Value> {
    match method {
        "append" => {
            arity(method, &args, 1, 1)?;
            items.extend(args);
            Ok(Value::None)
        }
        "extend" => {
            arity(method, &args, 1, 1)?;
            items.extend(collect(args.into_iter().next().unwrap_or(Value::None))?);
            Ok(Value::None)
        }
        "insert" => {
            arity(method, &args, 2, 2)?;
            let index = to_int(&args[0])?;
            let len = items.len() as i64;
            let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(at as usize, args[1].clone());
            Ok(Value::None)
        }
        "pop" => {
            arity(method, &args, 0, 1)?;
            if items.is_empty() {
                return Err(ScriptError::new(ErrorKind::IndexError, "pop from empty list"));
            }
            let index = match args.first() {
                Some(v) => to_int(v)?,
                None => -1,
            };
            let idx = normalize_index(index, items.len())
                .ok_or_else(|| ScriptError::new(ErrorKind::IndexError, "pop index out of range"))?;
            Ok(items.remove(idx))
        }
        "remove" => {
            arity(method, &args, 1, 1)?;
            let idx = items.iter().position(|v| v.py_eq(&args[0])).ok_or_else(|| {
                ScriptError::value_error("list.remove(x): x not in list")
            })?;
            items.remove(idx);
            Ok(Value::None)
        }
        "clear" => {
            items.clear();
            Ok(Value::None)
        }
        "reverse" => {
            items.reverse();
            Ok(Value::None)
        }
        "index" => {
            arity(method, &args, 1, 1)?;
            items
                .iter()
                .position(|v| v.py_eq(&args[0]))
                .map(|i| Value::Int(i as i64))
                .ok_or_else(|| ScriptError::value_error(format!("{} is not in list", args[0].repr())))
        }
        "count" => {
            arity(method, &args, 1, 1)?;
            Ok(Value::Int(
                items.iter().filter(|v| v.py_eq(&args[0])).count() as i64,
            ))
        }
        "copy" => Ok(Value::List(items.clone())),
        _ => Err(no_attribute("list", method)),
    }
}

fn dict_method(dict: &mut Dict, method: &str, args: Vec<Value>) -> ScriptResult<Value> {
    match method {
        "get" => {
            arity(method, &args, 1, 2)?;
            Ok(dict
                .get(&args[0])
                .cloned()
                .or_else(|| args.get(1).cloned())
                .unwrap_or(Value::None))
        }
        "keys" => Ok(Value::List(dict.keys().cloned().collect())),
        "values" => Ok(Value::List(dict.values().cloned().collect())),
        "items" => Ok(Value::List(
            dict.iter()
                .map(|(k, v)| Value::Tuple(vec![k.clone(), v.clone()]))
                .collect(),
        )),
        "pop" => {
            arity(method, &args, 1, 2)?;
            match dict.remove(&args[0]) {
                Some(value) => Ok(value),
                None => args
                    .get(1)
                    .cloned()
                    .ok_or_else(|| ScriptError::new(ErrorKind::KeyError, args[0].repr())),
            }
        }
        "popitem" => dict
            .pop_last()
            .map(|(k, v)| Value::Tuple(vec![k, v]))
            .ok_or_else(|| ScriptError::new(ErrorKind::KeyError, "popitem(): dictionary is empty")),
        "setdefault" => {
            arity(method, &args, 1, 2)?;
            if let Some(existing) = dict.get(&args[0]) {
                return Ok(existing.clone());
            }
            let default = args.get(1).cloned().unwrap_or(Value::None);
            dict.insert(args[0].clone(), default.clone())?;
            Ok(default)
        }
        "update" => {
            arity(method, &args, 1, 1)?;
            match &args[0] {
                Value::Dict(other) => {
                    for (k, v) in other.iter() {
                        dict.insert(k.clone(), v.clone())?;
                    }
                    Ok(Value::None)
                }
                other => Err(ScriptError::type_error(format!(
                    "'{}' object is not a mapping",
                    other.type_name()
                ))),
            }
        }
        "clear" => {
            dict.clear();
            Ok(Value::None)
        }
        "copy" => Ok(Value::Dict(dict.clone())),
        _ => Err(no_attribute("dict", method)),
    }
}

/// `str.format` with `{}`, `{0}`, `{name}` fields and `:.Nf` / `:d` specs.
fn format_str(template: &str, args: &[Value], kwargs: &Kwargs) -> ScriptResult<String> {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    let mut auto_index = 0;

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => field.push(ch),
                        None => {
                            return Err(ScriptError::value_error(
                                "expected '}' before end of string",
                            ));
                        }
                    }
                }
                let (name, spec) = field.split_once(':').unwrap_or((field.as_str(), ""));
                let value = if name.is_empty() {
                    let value = args.get(auto_index);
                    auto_index += 1;
                    value
                } else if let Ok(index) = name.parse::<usize>() {
                    args.get(index)
                } else {
                    kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
                };
                let value = value.ok_or_else(|| {
                    ScriptError::new(
                        ErrorKind::IndexError,
                        format!("Replacement index {} out of range for positional args tuple", name),
                    )
                })?;
                out.push_str(&format_spec(value, spec)?);
            }
            '}' => {
                return Err(ScriptError::value_error(
                    "Single '}' encountered in format string",
                ));
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

fn format_spec(value: &Value, spec: &str) -> ScriptResult<String> {
    if spec.is_empty() {
        return Ok(value.display());
    }
    if spec == "d" {
        return match value {
            Value::Int(i) => Ok(i.to_string()),
            Value::Bool(b) => Ok((*b as i64).to_string()),
            _ => Err(ScriptError::value_error(format!(
                "Unknown format code 'd' for object of type '{}'",
                value.type_name()
            ))),
        };
    }
    if let Some(precision) = spec.strip_prefix('.').and_then(|p| p.strip_suffix('f'))
        && let Ok(precision) = precision.parse::<usize>()
    {
        let f = to_f64(value)?;
        return Ok(format!("{:.*}", precision, f));
    }
    if spec == "f" {
        return Ok(format!("{:.6}", to_f64(value)?));
    }
    if spec == "g" {
        return Ok(format_float(to_f64(value)?));
    }
    Err(ScriptError::value_error(format!("unsupported format spec '{}'", spec)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_str() {
        let args = vec![Value::Int(3), Value::Float(2.5)];
        let kwargs = vec![("name".to_string(), Value::Str("x".into()))];
        assert_eq!(
            format_str("{} {:.2f} {name} {{}}", &args, &kwargs).unwrap(),
            "3 2.50 x {}"
        );
        assert_eq!(format_str("{1}-{0}", &args, &Kwargs::new()).unwrap(), "2.5-3");
        assert!(format_str("{5}", &args, &Kwargs::new()).is_err());
    }

    #[test]
    fn test_module_attrs() {
        assert!(matches!(Module::Math.attr("pi"), Some(Value::Float(_))));
        assert_eq!(
            Module::Time.attr("sleep").map(|v| v.repr()),
            Some("<built-in function sleep>".to_string())
        );
        assert!(Module::Math.attr("nope").is_none());
    }

    #[test]
    fn test_list_methods() {
        let mut items = vec![Value::Int(1), Value::Int(2)];
        list_method(&mut items, "append", vec![Value::Int(3)]).unwrap();
        list_method(&mut items, "insert", vec![Value::Int(0), Value::Int(0)]).unwrap();
        let popped = list_method(&mut items, "pop", vec![]).unwrap();
        assert!(popped.py_eq(&Value::Int(3)));
        assert_eq!(Value::List(items).repr(), "[0, 1, 2]");
    }

    #[test]
    fn test_str_methods() {
        assert!(
            str_method("  a b  ", "strip", vec![])
                .unwrap()
                .py_eq(&Value::Str("a b".into()))
        );
        let parts = str_method("a,b", "split", vec![Value::Str(",".into())]).unwrap();
        assert_eq!(parts.repr(), "['a', 'b']");
        assert!(str_method("abc", "nope", vec![]).is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("out.txt").to_string_lossy().to_string();

        let Value::File(writer) = open_file(path.clone(), "w").unwrap() else {
            panic!("expected file");
        };
        file_method(&writer, "write", vec![Value::Str("one\ntwo\n".into())]).unwrap();
        file_method(&writer, "close", vec![]).unwrap();
        assert!(file_method(&writer, "write", vec![Value::Str("x".into())]).is_err());

        let Value::File(reader) = open_file(path, "r").unwrap() else {
            panic!("expected file");
        };
        let lines = file_lines(&reader).unwrap();
        assert_eq!(Value::List(lines).repr(), "['one\\n', 'two\\n']");
    }

    #[test]
    fn test_open_missing_file() {
        let err = open_file("/definitely/not/here.txt".to_string(), "r").unwrap_err();
        assert_eq!(err.kind, ErrorKind::OSError);
    }
}
