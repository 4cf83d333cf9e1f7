//! Worker side of a job: run a cell statement by statement.
//!
//! Every message goes to the parent through [`ChildConsole`], so printed
//! text, deltas and the final `Done` share one ordered stream.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::ipc::{VariableEntry, WorkerResponse, write_message};
use crate::namespace::{Namespace, encode_value, persist_at};
use crate::script::{
    Console, ErrorKind, Interpreter, ScriptError, ScriptSplitter, StoredValue, Value,
};

use super::statements::StatementLoop;

/// Everything the worker needs to run one cell.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub document_id: String,
    pub source: String,
    pub snapshot: BTreeMap<String, StoredValue>,
    pub imports: Vec<String>,
    /// Namespace checkpoint file. `None` disables checkpointing.
    pub namespace_path: Option<PathBuf>,
}

/// Console that streams completed lines to the parent.
pub struct ChildConsole<W: Write> {
    writer: W,
    partial: String,
    broken: Option<Error>,
}

impl<W: Write> ChildConsole<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            partial: String::new(),
            broken: None,
        }
    }

    /// Send a message unless the stream already failed.
    pub fn send(&mut self, response: &WorkerResponse) {
        if self.broken.is_some() {
            return;
        }
        if let Err(e) = write_message(&mut self.writer, response) {
            tracing::error!("Lost connection to parent: {}", e);
            self.broken = Some(e);
        }
    }

    /// Send the unterminated tail of the printed text, if any.
    pub fn flush_partial(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.send(&WorkerResponse::Output { line });
        }
    }

    /// Take the first write error, if any.
    pub fn take_error(&mut self) -> Option<Error> {
        self.broken.take()
    }

    pub fn is_broken(&self) -> bool {
        self.broken.is_some()
    }
}

impl<W: Write> Console for ChildConsole<W> {
    fn write_text(&mut self, text: &str) {
        for c in text.chars() {
            if c == '\n' {
                let line = std::mem::take(&mut self.partial);
                self.send(&WorkerResponse::Output { line });
            } else {
                self.partial.push(c);
            }
        }
    }
}

/// Whether a name is kept in the namespace.
fn is_tracked(name: &str) -> bool {
    !(name.starts_with("__") && name.ends_with("__"))
}

fn stored_globals(globals: &BTreeMap<String, Value>) -> BTreeMap<String, StoredValue> {
    globals
        .iter()
        .filter(|(name, _)| is_tracked(name))
        .filter_map(|(name, value)| value.to_stored().map(|v| (name.clone(), v)))
        .collect()
}

/// Run a job, writing every response to `writer`.
///
/// Returns whether the cell raised an error. A `Done` message is always the
/// last thing written; an `Err` means the stream to the parent broke.
pub fn run_job<W: Write>(request: JobRequest, writer: W) -> Result<bool> {
    let globals: BTreeMap<String, Value> = request
        .snapshot
        .into_iter()
        .map(|(name, value)| (name, Value::from(value)))
        .collect();
    let mut interp = Interpreter::with_globals(globals, ChildConsole::new(writer));

    for line in &request.imports {
        if let Err(e) = interp.run_source(line) {
            tracing::warn!("Skipping import '{}' for {}: {}", line, request.document_id, e);
        }
    }

    let mut imports = request.imports;
    let mut last = stored_globals(interp.globals());
    let mut failed = false;
    let splitter = ScriptSplitter;

    for unit in StatementLoop::new(&splitter, &request.source) {
        let program = match unit {
            Ok(program) => program,
            Err(err) => {
                let mut script_err = ScriptError::new(ErrorKind::SyntaxError, err.message);
                let text = request
                    .source
                    .split('\n')
                    .nth(err.line.saturating_sub(1))
                    .map(str::to_string);
                script_err.push_frame(err.line, "<cell>", text);
                interp.console_mut().flush_partial();
                interp.console_mut().send(&WorkerResponse::Failure {
                    lines: script_err.traceback(),
                });
                failed = true;
                break;
            }
        };

        if let Err(err) = interp.run(&program) {
            tracing::debug!("Cell raised {} at line {:?}", err.kind, err.frames.last().map(|f| f.line));
            interp.console_mut().flush_partial();
            interp.console_mut().send(&WorkerResponse::Failure {
                lines: err.traceback(),
            });
            failed = true;
            break;
        }

        let mut new_imports = Vec::new();
        for line in program.import_lines() {
            if !imports.contains(&line) {
                imports.push(line.clone());
                new_imports.push(line);
            }
        }

        let current = stored_globals(interp.globals());
        let variables = changed_entries(&last, &current, encode_value);
        let removed: Vec<String> = last
            .keys()
            .filter(|name| !current.contains_key(*name))
            .cloned()
            .collect();

        if !variables.is_empty() || !removed.is_empty() || !new_imports.is_empty() {
            if let Some(path) = &request.namespace_path {
                let namespace = Namespace {
                    variables: current
                        .iter()
                        .map(|(name, value)| (name.clone(), Value::from(value.clone())))
                        .collect(),
                    imports: imports.clone(),
                };
                if let Err(e) = persist_at(path, &namespace) {
                    tracing::warn!("Failed to checkpoint namespace {}: {}", path.display(), e);
                }
            }
            interp.console_mut().send(&WorkerResponse::Delta {
                variables,
                removed,
                imports: new_imports,
            });
        }
        last = current;

        if interp.console_mut().is_broken() {
            break;
        }
    }

    let console = interp.console_mut();
    console.flush_partial();
    console.send(&WorkerResponse::Done { error: failed });
    match console.take_error() {
        Some(e) => Err(e),
        None => Ok(failed),
    }
}

/// Encode the variables of `current` that differ from `last`.
///
/// A value that fails to encode is left out of the delta.
fn changed_entries(
    last: &BTreeMap<String, StoredValue>,
    current: &BTreeMap<String, StoredValue>,
    encode: impl Fn(&StoredValue) -> Result<Vec<u8>>,
) -> Vec<VariableEntry> {
    current
        .iter()
        .filter(|(name, value)| last.get(*name) != Some(*value))
        .filter_map(|(name, value)| match encode(value) {
            Ok(bytes) => Some(VariableEntry {
                name: name.clone(),
                bytes,
            }),
            Err(e) => {
                tracing::warn!("Not sending variable {}: {}", name, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::read_message;
    use crate::namespace::{decode_value, load_from};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn run(request: JobRequest) -> (bool, Vec<WorkerResponse>) {
        let mut buf = Vec::new();
        let failed = run_job(request, &mut buf).expect("stream should not break");
        let mut cursor = Cursor::new(buf);
        let mut responses = Vec::new();
        while let Ok(response) = read_message::<_, WorkerResponse>(&mut cursor) {
            responses.push(response);
        }
        (failed, responses)
    }

    fn request(source: &str) -> JobRequest {
        JobRequest {
            document_id: "doc".to_string(),
            source: source.to_string(),
            ..JobRequest::default()
        }
    }

    fn output_lines(responses: &[WorkerResponse]) -> Vec<String> {
        responses
            .iter()
            .filter_map(|r| match r {
                WorkerResponse::Output { line } => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_prints_and_deltas() {
        let (failed, responses) = run(request("x = 1\nprint(x)"));
        assert!(!failed);
        assert_eq!(output_lines(&responses), vec!["1"]);

        match &responses[0] {
            WorkerResponse::Delta { variables, removed, .. } => {
                assert_eq!(variables.len(), 1);
                assert_eq!(variables[0].name, "x");
                assert_eq!(decode_value(&variables[0].bytes).unwrap(), StoredValue::Int(1));
                assert!(removed.is_empty());
            }
            other => panic!("expected delta, got {:?}", other),
        }
        assert!(matches!(responses.last(), Some(WorkerResponse::Done { error: false })));
    }

    #[test]
    fn test_runtime_error_stops_block() {
        let (failed, responses) = run(request("x = 1\n1/0\nprint(x)"));
        assert!(failed);
        assert!(output_lines(&responses).is_empty());

        let lines = responses
            .iter()
            .find_map(|r| match r {
                WorkerResponse::Failure { lines } => Some(lines.clone()),
                _ => None,
            })
            .expect("failure trace");
        assert!(lines.iter().any(|l| l.contains("Cell line 2")));
        assert!(lines.last().unwrap().starts_with("ZeroDivisionError"));
        assert!(matches!(responses.last(), Some(WorkerResponse::Done { error: true })));
    }

    #[test]
    fn test_partial_line_flushed_before_done() {
        let (_, responses) = run(request("print('a', end='')\nprint('b', end='')"));
        assert_eq!(output_lines(&responses), vec!["ab"]);
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let (failed, responses) = run(request("x = 1\nif x\n    y = 2"));
        assert!(failed);
        let trace = responses
            .iter()
            .find_map(|r| match r {
                WorkerResponse::Failure { lines } => Some(lines.join("\n")),
                _ => None,
            })
            .unwrap();
        assert!(trace.contains("Cell line 2"));
        assert!(trace.contains("SyntaxError"));
    }

    #[test]
    fn test_snapshot_and_removal() {
        let mut req = request("y = x + 1\ndel x");
        req.snapshot.insert("x".to_string(), StoredValue::Int(41));
        let (failed, responses) = run(req);
        assert!(!failed);

        let deltas: Vec<_> = responses
            .iter()
            .filter_map(|r| match r {
                WorkerResponse::Delta { variables, removed, .. } => {
                    Some((variables.clone(), removed.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].0[0].name, "y");
        assert_eq!(deltas[1].1, vec!["x"]);
    }

    #[test]
    fn test_imports_replayed_and_recorded() {
        let (_, responses) = run(request("import math\nr = math.floor(2.5)"));
        let imports: Vec<String> = responses
            .iter()
            .flat_map(|r| match r {
                WorkerResponse::Delta { imports, .. } => imports.clone(),
                _ => Vec::new(),
            })
            .collect();
        assert_eq!(imports, vec!["import math"]);

        let mut req = request("print(math.floor(2.5))");
        req.imports = vec!["import math".to_string()];
        let (failed, responses) = run(req);
        assert!(!failed);
        assert_eq!(output_lines(&responses), vec!["2"]);
    }

    #[test]
    fn test_checkpoint_written_per_statement() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("doc.ns");
        let mut req = request("a = 1\nb = [a, 2]\nraise_here = 1/0");
        req.namespace_path = Some(path.clone());

        let (failed, _) = run(req);
        assert!(failed);

        let namespace = load_from(&path);
        assert_eq!(namespace.variables.len(), 2);
        assert_eq!(namespace.variables["b"].repr(), "[1, 2]");
        assert!(!namespace.variables.contains_key("raise_here"));
    }

    #[test]
    fn test_transient_values_not_sent() {
        let (_, responses) = run(request("import math\nm = math\nf = len"));
        for response in &responses {
            if let WorkerResponse::Delta { variables, .. } = response {
                assert!(variables.is_empty());
            }
        }
    }

    #[test]
    fn test_unencodable_variable_is_skipped() {
        let last = BTreeMap::from([("same".to_string(), StoredValue::Int(1))]);
        let current = BTreeMap::from([
            ("same".to_string(), StoredValue::Int(1)),
            ("bad".to_string(), StoredValue::Str("bad".to_string())),
            ("good".to_string(), StoredValue::Int(2)),
        ]);

        let entries = changed_entries(&last, &current, |value| match value {
            StoredValue::Str(_) => Err(Error::Serialization("unsupported".to_string())),
            other => encode_value(other),
        });
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["good"]);
    }
}
