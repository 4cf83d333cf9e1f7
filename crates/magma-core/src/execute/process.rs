//! Process-based executor for isolated cell execution.
//!
//! Every job runs in a fresh worker process. A reader thread moves the
//! worker's responses onto a channel, and the executor polls that channel
//! with a short timeout so it can report progress while the cell runs and
//! notice when the worker dies without finishing.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ipc::{WorkerCommand, WorkerHandle, WorkerKillHandle, WorkerResponse, read_message};
use crate::namespace::{Namespace, NamespaceDelta, decode_value, encode_variables};

/// Something that happened while a job was running.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// One printed line.
    Output(String),
    /// State changes of one finished statement.
    Delta(NamespaceDelta),
    /// Trace of the error that stopped the cell.
    Failure(Vec<String>),
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The worker reported completion.
    Completed { error: bool },
    /// The worker went away before reporting completion.
    Terminated { status: Option<ExitStatus> },
}

/// Receives progress of a running job.
pub trait JobObserver {
    /// The worker process is up; `kill` terminates it from any thread.
    fn on_spawn(&mut self, _kill: &WorkerKillHandle) {}

    fn on_event(&mut self, event: JobEvent);

    /// Called whenever a poll timed out without a message.
    fn on_tick(&mut self) {}
}

/// A cell to execute against a namespace.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub document_id: &'a str,
    pub source: &'a str,
    pub namespace: &'a Namespace,
    /// File the worker checkpoints the namespace to.
    pub namespace_path: &'a Path,
}

/// Runs cells in worker processes that can be killed at any time.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    worker_path: PathBuf,
    poll_interval: Duration,
}

impl ProcessExecutor {
    pub fn new(worker_path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            worker_path: worker_path.into(),
            poll_interval,
        }
    }

    /// Execute one cell in a new worker process.
    ///
    /// Returns once the worker has exited. A worker killed through the handle
    /// given to [`JobObserver::on_spawn`] yields [`JobOutcome::Terminated`].
    pub fn execute(
        &self,
        request: ExecutionRequest<'_>,
        observer: &mut dyn JobObserver,
    ) -> Result<JobOutcome> {
        let mut worker = WorkerHandle::spawn(&self.worker_path)?;
        let kill = worker.kill_handle();
        tracing::debug!("Worker {} running cell of {}", kill.pid(), request.document_id);
        observer.on_spawn(&kill);

        let command = WorkerCommand::Run {
            document_id: request.document_id.to_string(),
            source: request.source.to_string(),
            snapshot: encode_variables(&request.namespace.stored_variables())?,
            imports: request.namespace.imports.clone(),
            namespace_path: request.namespace_path.to_string_lossy().into_owned(),
        };
        if let Err(e) = worker.send_command(&command) {
            if kill.is_killed() {
                let status = worker.wait().ok();
                return Ok(JobOutcome::Terminated { status });
            }
            return Err(e);
        }

        let mut stdout = worker
            .take_stdout()
            .ok_or_else(|| Error::Ipc("Worker stdout already taken".to_string()))?;
        let (tx, rx) = mpsc::channel();
        let reader = thread::Builder::new()
            .name("magma-worker-reader".to_string())
            .spawn(move || {
                loop {
                    match read_message::<_, WorkerResponse>(&mut stdout) {
                        Ok(response) => {
                            let done = matches!(response, WorkerResponse::Done { .. });
                            if tx.send(response).is_err() || done {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("Worker stream closed: {}", e);
                            break;
                        }
                    }
                }
            })?;

        let mut completed = None;
        loop {
            match rx.recv_timeout(self.poll_interval) {
                Ok(WorkerResponse::Output { line }) => observer.on_event(JobEvent::Output(line)),
                Ok(WorkerResponse::Delta {
                    variables,
                    removed,
                    imports,
                }) => {
                    let mut delta = NamespaceDelta {
                        removed,
                        imports,
                        ..NamespaceDelta::default()
                    };
                    for entry in variables {
                        match decode_value(&entry.bytes) {
                            Ok(value) => {
                                delta.set.insert(entry.name, value);
                            }
                            Err(e) => tracing::warn!("Dropping variable '{}': {}", entry.name, e),
                        }
                    }
                    observer.on_event(JobEvent::Delta(delta));
                }
                Ok(WorkerResponse::Failure { lines }) => observer.on_event(JobEvent::Failure(lines)),
                Ok(WorkerResponse::Done { error }) => {
                    completed = Some(error);
                    break;
                }
                Ok(WorkerResponse::Pong) => {}
                Err(RecvTimeoutError::Timeout) => observer.on_tick(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let outcome = match completed {
            Some(error) => {
                let _ = worker.send_command(&WorkerCommand::Shutdown);
                let status = worker.wait()?;
                if !status.success() && !kill.is_killed() {
                    tracing::debug!("Worker exited with {} after completing", status);
                }
                JobOutcome::Completed { error }
            }
            None => JobOutcome::Terminated {
                status: worker.wait().ok(),
            },
        };
        if reader.join().is_err() {
            tracing::warn!("Worker reader thread panicked");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Vec<JobEvent>);

    impl JobObserver for Recorder {
        fn on_event(&mut self, event: JobEvent) {
            self.0.push(event);
        }
    }

    #[test]
    fn test_missing_worker_is_an_error() {
        let executor = ProcessExecutor::new("/nonexistent/magma-worker", Duration::from_millis(10));
        let namespace = Namespace::new();
        let request = ExecutionRequest {
            document_id: "doc",
            source: "x = 1",
            namespace: &namespace,
            namespace_path: Path::new("/tmp/unused.ns"),
        };
        let mut recorder = Recorder(Vec::new());

        let result = executor.execute(request, &mut recorder);
        assert!(matches!(result, Err(Error::Worker(_))));
        assert!(recorder.0.is_empty());
    }
}
