//! Runtime values.
//!
//! Containers have value semantics: cloning a list clones its items.
//! Transient handles (modules, builtins, open files) cannot be stored; the
//! serializable subset is [`StoredValue`], reached through
//! [`Value::to_stored`].

use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::sync::{Arc, Mutex};

use bincode::{Decode, Encode};

use super::ast::FunctionDef;
use super::builtins::{Builtin, Module, file_lines};
use super::error::{ScriptError, ScriptResult};

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Dict),
    Range { start: i64, stop: i64, step: i64 },
    Function(Arc<FunctionDef>),
    Builtin(Builtin),
    Module(Module),
    File(FileHandle),
}

/// Insertion-ordered mapping with value-equality keys.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k.py_eq(key)).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &Value) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k.py_eq(key))
            .map(|(_, v)| v)
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace. Unhashable keys are rejected.
    pub fn insert(&mut self, key: Value, value: Value) -> ScriptResult<()> {
        if !key.is_hashable() {
            return Err(ScriptError::type_error(format!(
                "unhashable type: '{}'",
                key.type_name()
            )));
        }
        match self.get_mut(&key) {
            Some(slot) => *slot = value,
            None => self.entries.push((key, value)),
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k.py_eq(key))?;
        Some(self.entries.remove(idx).1)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }

    pub fn pop_last(&mut self) -> Option<(Value, Value)> {
        self.entries.pop()
    }
}

/// Open file handle shared between copies of the value.
#[derive(Clone)]
pub struct FileHandle {
    pub path: String,
    pub state: Arc<Mutex<FileState>>,
}

pub enum FileState {
    Reader(BufReader<File>),
    Writer(BufWriter<File>),
    Closed,
}

impl FileHandle {
    pub fn new(path: String, state: FileState) -> Self {
        Self {
            path,
            state: Arc::new(Mutex::new(state)),
        }
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle").field("path", &self.path).finish()
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Range { .. } => "range",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Module(_) => "module",
            Value::File(_) => "TextIOWrapper",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) | Value::Tuple(items) => !items.is_empty(),
            Value::Dict(dict) => !dict.is_empty(),
            Value::Range { .. } => range_len(self) > 0,
            _ => true,
        }
    }

    fn is_hashable(&self) -> bool {
        match self {
            Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) => true,
            Value::Tuple(items) => items.iter().all(Value::is_hashable),
            _ => false,
        }
    }

    /// Numeric view used by arithmetic; bools count as ints.
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Bool(b) => Some(Number::Int(*b as i64)),
            Value::Int(i) => Some(Number::Int(*i)),
            Value::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    /// Equality as `==` sees it.
    pub fn py_eq(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return match (a, b) {
                (Number::Int(x), Number::Int(y)) => x == y,
                _ => a.as_f64() == b.as_f64(),
            };
        }
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.py_eq(w)))
            }
            (
                Value::Range { start, stop, step },
                Value::Range {
                    start: s2,
                    stop: e2,
                    step: st2,
                },
            ) => start == s2 && stop == e2 && step == st2,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::File(a), Value::File(b)) => Arc::ptr_eq(&a.state, &b.state),
            _ => false,
        }
    }

    /// Ordering as `<` sees it.
    pub fn py_cmp(&self, other: &Value) -> ScriptResult<Ordering> {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return match (a, b) {
                (Number::Int(x), Number::Int(y)) => Ok(x.cmp(&y)),
                _ => a
                    .as_f64()
                    .partial_cmp(&b.as_f64())
                    .ok_or_else(|| ScriptError::value_error("cannot order NaN")),
            };
        }
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                for (x, y) in a.iter().zip(b) {
                    if !x.py_eq(y) {
                        return x.py_cmp(y);
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            _ => Err(ScriptError::type_error(format!(
                "'<' not supported between instances of '{}' and '{}'",
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    /// Text produced by `str()` and `print`.
    pub fn display(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.repr(),
        }
    }

    /// Text produced by `repr()`.
    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => quote_str(s),
            Value::List(items) => format!("[{}]", join_repr(items)),
            Value::Tuple(items) if items.len() == 1 => format!("({},)", items[0].repr()),
            Value::Tuple(items) => format!("({})", join_repr(items)),
            Value::Dict(dict) => {
                let parts: Vec<String> = dict
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Range { start, stop, step } if *step == 1 => format!("range({}, {})", start, stop),
            Value::Range { start, stop, step } => format!("range({}, {}, {})", start, stop, step),
            Value::Function(def) => format!("<function {}>", def.name),
            Value::Builtin(b) => format!("<built-in function {}>", b.name()),
            Value::Module(m) => format!("<module '{}'>", m.name()),
            Value::File(handle) => format!("<file '{}'>", handle.path),
        }
    }

    /// Convert to the storable subset, or `None` if any part is a transient
    /// handle.
    pub fn to_stored(&self) -> Option<StoredValue> {
        Some(match self {
            Value::None => StoredValue::None,
            Value::Bool(b) => StoredValue::Bool(*b),
            Value::Int(i) => StoredValue::Int(*i),
            Value::Float(f) => StoredValue::Float(*f),
            Value::Str(s) => StoredValue::Str(s.clone()),
            Value::List(items) => {
                StoredValue::List(items.iter().map(Value::to_stored).collect::<Option<_>>()?)
            }
            Value::Tuple(items) => {
                StoredValue::Tuple(items.iter().map(Value::to_stored).collect::<Option<_>>()?)
            }
            Value::Dict(dict) => StoredValue::Dict(
                dict.iter()
                    .map(|(k, v)| Some((k.to_stored()?, v.to_stored()?)))
                    .collect::<Option<_>>()?,
            ),
            Value::Range { start, stop, step } => StoredValue::Range {
                start: *start,
                stop: *stop,
                step: *step,
            },
            Value::Function(def) => StoredValue::Function(def.as_ref().clone()),
            Value::Builtin(_) | Value::Module(_) | Value::File(_) => return None,
        })
    }

    pub fn is_serializable(&self) -> bool {
        self.to_stored().is_some()
    }

    /// Consume the value as an iterable.
    pub fn iter_values(self) -> ScriptResult<ValueIter> {
        match self {
            Value::List(items) | Value::Tuple(items) => Ok(ValueIter::Items(items.into_iter())),
            Value::Str(s) => Ok(ValueIter::Items(
                s.chars()
                    .map(|c| Value::Str(c.to_string()))
                    .collect::<Vec<_>>()
                    .into_iter(),
            )),
            Value::Dict(dict) => Ok(ValueIter::Items(
                dict.entries
                    .into_iter()
                    .map(|(k, _)| k)
                    .collect::<Vec<_>>()
                    .into_iter(),
            )),
            Value::Range { start, stop, step } => Ok(ValueIter::Range {
                next: Some(start),
                stop,
                step,
            }),
            Value::File(handle) => Ok(ValueIter::Items(file_lines(&handle)?.into_iter())),
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }
}

/// Iterator over the items of an iterable value.
pub enum ValueIter {
    Items(std::vec::IntoIter<Value>),
    Range {
        next: Option<i64>,
        stop: i64,
        step: i64,
    },
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::Items(items) => items.next(),
            ValueIter::Range { next, stop, step } => {
                let current = (*next)?;
                let in_range = if *step > 0 {
                    current < *stop
                } else {
                    current > *stop
                };
                if !in_range {
                    *next = None;
                    return None;
                }
                *next = current.checked_add(*step);
                Some(Value::Int(current))
            }
        }
    }
}

impl From<StoredValue> for Value {
    fn from(stored: StoredValue) -> Self {
        match stored {
            StoredValue::None => Value::None,
            StoredValue::Bool(b) => Value::Bool(b),
            StoredValue::Int(i) => Value::Int(i),
            StoredValue::Float(f) => Value::Float(f),
            StoredValue::Str(s) => Value::Str(s),
            StoredValue::List(items) => Value::List(items.into_iter().map(Value::from).collect()),
            StoredValue::Tuple(items) => Value::Tuple(items.into_iter().map(Value::from).collect()),
            StoredValue::Dict(pairs) => Value::Dict(Dict {
                entries: pairs
                    .into_iter()
                    .map(|(k, v)| (Value::from(k), Value::from(v)))
                    .collect(),
            }),
            StoredValue::Range { start, stop, step } => Value::Range { start, stop, step },
            StoredValue::Function(def) => Value::Function(Arc::new(def)),
        }
    }
}

/// Serializable form of a [`Value`].
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum StoredValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<StoredValue>),
    Tuple(Vec<StoredValue>),
    Dict(Vec<(StoredValue, StoredValue)>),
    Range { start: i64, stop: i64, step: i64 },
    Function(FunctionDef),
}

impl StoredValue {
    /// Short human readable rendering, used by listings.
    pub fn repr(&self) -> String {
        Value::from(self.clone()).repr()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

/// Number of items a range yields.
pub fn range_len(value: &Value) -> usize {
    let Value::Range { start, stop, step } = *value else {
        return 0;
    };
    let (start, stop, step) = (start as i128, stop as i128, step as i128);
    let len = if step > 0 && start < stop {
        (stop - start + step - 1) / step
    } else if step < 0 && start > stop {
        (start - stop - step - 1) / -step
    } else {
        0
    };
    usize::try_from(len).unwrap_or(usize::MAX)
}

fn join_repr(items: &[Value]) -> String {
    items.iter().map(Value::repr).collect::<Vec<_>>().join(", ")
}

fn quote_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Render a float the way Python's `repr` does for common values.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let formatted = format!("{:e}", f);
        return match formatted.split_once('e') {
            Some((mantissa, exp)) => {
                let (sign, digits) = match exp.strip_prefix('-') {
                    Some(d) => ('-', d),
                    None => ('+', exp),
                };
                format!("{}e{}{:0>2}", mantissa, sign, digits)
            }
            None => formatted,
        };
    }
    if f.fract() == 0.0 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(-2.5), "-2.5");
        assert_eq!(format_float(1e-5), "1e-05");
        assert_eq!(format_float(1e20), "1e+20");
        assert_eq!(format_float(f64::INFINITY), "inf");
    }

    #[test]
    fn test_repr() {
        let list = Value::List(vec![
            Value::Int(1),
            Value::Str("a'b".into()),
            Value::Tuple(vec![Value::None]),
        ]);
        assert_eq!(list.repr(), r#"[1, "a'b", (None,)]"#);
        assert_eq!(Value::Str("x".into()).display(), "x");
        assert_eq!(Value::Str("x".into()).repr(), "'x'");
    }

    #[test]
    fn test_py_eq_numeric() {
        assert!(Value::Int(1).py_eq(&Value::Float(1.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert!(!Value::Int(1).py_eq(&Value::Str("1".into())));
    }

    #[test]
    fn test_dict_insert_replace() {
        let mut dict = Dict::new();
        dict.insert(Value::Str("a".into()), Value::Int(1)).unwrap();
        dict.insert(Value::Str("a".into()), Value::Int(2)).unwrap();
        assert_eq!(dict.len(), 1);
        assert!(dict.get(&Value::Str("a".into())).unwrap().py_eq(&Value::Int(2)));
        assert!(dict.insert(Value::List(vec![]), Value::None).is_err());
    }

    #[test]
    fn test_to_stored_rejects_handles() {
        assert!(Value::Module(Module::Math).to_stored().is_none());
        let nested = Value::List(vec![Value::Int(1), Value::Builtin(Builtin::Len)]);
        assert!(nested.to_stored().is_none());
        assert!(Value::Int(3).is_serializable());
    }

    #[test]
    fn test_stored_value_roundtrip() {
        let mut dict = Dict::new();
        dict.insert(Value::Str("k".into()), Value::List(vec![Value::Float(0.5)]))
            .unwrap();
        let value = Value::Dict(dict);
        let stored = value.to_stored().unwrap();
        assert!(Value::from(stored).py_eq(&value));
    }

    #[test]
    fn test_range_iteration() {
        let items: Vec<i64> = Value::Range {
            start: 5,
            stop: 0,
            step: -2,
        }
        .iter_values()
        .unwrap()
        .map(|v| match v {
            Value::Int(i) => i,
            _ => unreachable!(),
        })
        .collect();
        assert_eq!(items, vec![5, 3, 1]);
    }

    #[test]
    fn test_range_len() {
        let r = |start, stop, step| range_len(&Value::Range { start, stop, step });
        assert_eq!(r(0, 10, 1), 10);
        assert_eq!(r(0, 10, 3), 4);
        assert_eq!(r(10, 0, -2), 5);
        assert_eq!(r(5, 0, 1), 0);
    }
}
