//! Session controller: submit, interrupt and restart.
//!
//! A session owns the job queue, the dispatcher thread and the state of the
//! job currently running. All documents share one execution lane.
//!
//! ```text
//! submit ──► JobQueue ──► dispatcher ──► ProcessExecutor ──► magma-worker
//!   │                        │                 │
//!   └─ placeholder           └─ finalize ◄─────┘ (events, outcome)
//!                                 │
//!                                 └─ OutputRenderer ──► DocumentHost
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, EvaluationJob, Gate, JobQueue, JobRunner};
use crate::document::{DocumentId, DocumentLines};
use crate::error::Result;
use crate::execute::{ExecutionRequest, JobEvent, JobObserver, JobOutcome, ProcessExecutor};
use crate::ipc::{WorkerKillHandle, find_worker_binary};
use crate::locator::locate_cell;
use crate::namespace::{Namespace, NamespaceDelta, NamespaceStore};
use crate::paths::StateDirs;
use crate::render::{DocumentHost, JobState, OutputRenderer, write_placeholder};
use crate::script::{ErrorKind, ScriptError};

/// Control operation applied to a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Interrupted,
    Restarted,
}

#[derive(Debug)]
struct ActiveJob {
    eval_id: u64,
    document_id: DocumentId,
    kill: Option<WorkerKillHandle>,
}

#[derive(Debug, Default)]
struct EvalState {
    active: Option<ActiveJob>,
    /// Signal for the job with the given eval id, consumed by its finalize.
    signal: Option<(u64, Signal)>,
}

struct Shared {
    config: EngineConfig,
    host: Arc<dyn DocumentHost>,
    store: NamespaceStore,
    executor: ProcessExecutor,
    queue: Arc<JobQueue>,
    gate: Arc<Gate>,
    state: Mutex<EvalState>,
    state_changed: Condvar,
    namespaces: Mutex<FxHashMap<DocumentId, Namespace>>,
    touched: Mutex<FxHashSet<DocumentId>>,
    /// Bumped by every restart.
    generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn namespace_for(&self, id: &DocumentId) -> Namespace {
        let mut cache = lock(&self.namespaces);
        cache
            .entry(id.clone())
            .or_insert_with(|| self.store.load(id))
            .clone()
    }

    fn reload_namespace(&self, id: &DocumentId) {
        let namespace = self.store.load(id);
        lock(&self.namespaces).insert(id.clone(), namespace);
    }

    fn submit(
        &self,
        document_id: &DocumentId,
        doc: &mut DocumentLines,
        line: usize,
        delayed: bool,
    ) -> Option<u64> {
        let region = locate_cell(doc.as_slice(), line)?;
        if region.is_empty_body() {
            tracing::debug!("Ignoring empty cell at line {} of {}", line, document_id);
            return None;
        }

        let eval_id = self.queue.submit(|eval_id| {
            write_placeholder(doc, &region, eval_id);
            EvaluationJob {
                document_id: document_id.clone(),
                source_text: region.source_text().to_string(),
                region: region.clone(),
                eval_id,
                delayed,
                generation: self.generation.load(Ordering::SeqCst),
            }
        })?;
        lock(&self.touched).insert(document_id.clone());
        tracing::debug!("Queued evaluation {} for {}", eval_id, document_id);
        Some(eval_id)
    }

    /// Wait until the job `eval_id` is no longer active.
    fn join_active(&self, eval_id: u64) -> bool {
        let timeout = self.config.join_timeout();
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if state.active.as_ref().is_none_or(|a| a.eval_id != eval_id) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("Evaluation {} did not wind down within {:?}", eval_id, timeout);
                if let Some(active) = state.active.as_mut() {
                    active.kill = None;
                }
                return false;
            }
            state = self
                .state_changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Signal the active job, kill its process and wait for it to finish.
    /// Returns whether a job was active.
    fn stop_active(&self, signal: Signal) -> bool {
        let (eval_id, kill) = {
            let mut state = lock(&self.state);
            let Some(active) = state.active.as_ref() else {
                return false;
            };
            let eval_id = active.eval_id;
            let kill = active.kill.clone();
            tracing::info!("{:?} evaluation {} of {}", signal, eval_id, active.document_id);
            state.signal = Some((eval_id, signal));
            self.state_changed.notify_all();
            (eval_id, kill)
        };
        if let Some(kill) = kill {
            kill.kill();
        }
        self.join_active(eval_id);
        true
    }

    /// Take the signal addressed to `eval_id`, if any.
    fn take_signal(&self, eval_id: u64) -> Option<Signal> {
        let mut state = lock(&self.state);
        match state.signal {
            Some((id, signal)) if id == eval_id => {
                state.signal = None;
                Some(signal)
            }
            _ => None,
        }
    }

    /// Sleep the start delay of an active job. Returns early, with true,
    /// once the job is signalled.
    fn wait_start_delay(&self, eval_id: u64) -> bool {
        let deadline = Instant::now() + self.config.start_delay();
        let mut state = lock(&self.state);
        loop {
            if state.signal.is_some_and(|(id, _)| id == eval_id) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .state_changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    fn clear_active(&self, eval_id: u64) {
        let mut state = lock(&self.state);
        if state.active.as_ref().is_some_and(|a| a.eval_id == eval_id) {
            state.active = None;
        }
        self.state_changed.notify_all();
    }

    /// Show a final state in the block of a job that never ran.
    fn render_terminal(&self, job: &EvaluationJob, state: JobState) {
        let mut renderer =
            OutputRenderer::new(Arc::clone(&self.host), job, self.config.refresh_interval());
        renderer.finish(state);
    }

    fn interrupt(&self) -> bool {
        if lock(&self.state).active.is_none() {
            return false;
        }
        let drained = self.queue.drain();
        let was_active = self.stop_active(Signal::Interrupted);
        for job in &drained {
            self.render_terminal(job, JobState::KernelInterrupted);
        }
        was_active
    }

    fn restart(&self) {
        self.gate.close();
        self.generation.fetch_add(1, Ordering::SeqCst);
        let drained = self.queue.drain();
        self.stop_active(Signal::Restarted);

        self.queue.reset_counter();
        lock(&self.namespaces).clear();
        for job in &drained {
            self.render_terminal(job, JobState::KernelRestarted);
        }
        let touched: Vec<DocumentId> = lock(&self.touched).drain().collect();
        for id in &touched {
            if let Err(e) = self.store.delete(id) {
                tracing::warn!("Failed to delete namespace of {}: {}", id, e);
            }
        }
        self.gate.open();
        tracing::info!("Session restarted");
    }
}

/// Observer wiring one running job to the session and its output block.
struct SessionObserver<'a> {
    shared: &'a Shared,
    eval_id: u64,
    renderer: OutputRenderer,
    delta: NamespaceDelta,
    failed: bool,
}

impl JobObserver for SessionObserver<'_> {
    fn on_spawn(&mut self, kill: &WorkerKillHandle) {
        let mut state = lock(&self.shared.state);
        let signalled = state
            .signal
            .is_some_and(|(eval_id, _)| eval_id == self.eval_id);
        if let Some(active) = state.active.as_mut()
            && active.eval_id == self.eval_id
        {
            active.kill = Some(kill.clone());
        }
        if signalled {
            kill.kill();
        }
    }

    fn on_event(&mut self, event: JobEvent) {
        match event {
            JobEvent::Output(line) => {
                self.renderer.push_line(line);
                self.renderer.refresh();
            }
            JobEvent::Delta(delta) => self.delta.absorb(delta),
            JobEvent::Failure(lines) => {
                self.failed = true;
                self.renderer.push_lines(lines);
                self.renderer.refresh();
            }
        }
    }

    fn on_tick(&mut self) {
        self.renderer.refresh();
    }
}

/// Runs jobs on the dispatcher thread.
struct SessionRunner {
    shared: Arc<Shared>,
}

impl SessionRunner {
    fn finalize(
        &self,
        job: &EvaluationJob,
        outcome: Result<JobOutcome>,
        mut observer: SessionObserver<'_>,
    ) -> Result<()> {
        let shared = &*self.shared;
        let signal = shared.take_signal(job.eval_id);
        let restarted = signal == Some(Signal::Restarted)
            || shared.generation.load(Ordering::SeqCst) != job.generation;

        let state = if restarted {
            JobState::KernelRestarted
        } else if signal == Some(Signal::Interrupted) {
            observer.renderer.push_lines(interrupt_trace(&job.source_text));
            shared.reload_namespace(&job.document_id);
            JobState::KernelInterrupted
        } else {
            match outcome {
                Ok(JobOutcome::Completed { error }) => {
                    match shared.store.merge(&job.document_id, &observer.delta) {
                        Ok(namespace) => {
                            lock(&shared.namespaces).insert(job.document_id.clone(), namespace);
                        }
                        Err(e) => {
                            tracing::warn!("Failed to save namespace of {}: {}", job.document_id, e);
                            shared.reload_namespace(&job.document_id);
                        }
                    }
                    if error || observer.failed {
                        JobState::Error
                    } else {
                        JobState::Done
                    }
                }
                Ok(JobOutcome::Terminated { status }) => {
                    let message = match status {
                        Some(status) => format!("worker exited with {}", status),
                        None => "worker exited unexpectedly".to_string(),
                    };
                    observer
                        .renderer
                        .push_lines(ScriptError::new(ErrorKind::WorkerExited, message).traceback());
                    shared.reload_namespace(&job.document_id);
                    JobState::Error
                }
                Err(e) => {
                    // Rendered by the dispatcher's failure report
                    shared.clear_active(job.eval_id);
                    return Err(e);
                }
            }
        };

        observer.renderer.finish(state);
        tracing::debug!(
            "Evaluation {} finished as {} after {:.2?}",
            job.eval_id,
            state,
            observer.renderer.elapsed()
        );
        shared.clear_active(job.eval_id);
        Ok(())
    }
}

/// Trace shown for an interrupted job, pointing at its last non-blank line.
fn interrupt_trace(source: &str) -> Vec<String> {
    let mut err = ScriptError::new(ErrorKind::KeyboardInterrupt, "");
    if let Some((idx, text)) = source
        .split('\n')
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .last()
    {
        err.push_frame(idx + 1, "<cell>", Some(text.to_string()));
    }
    err.traceback()
}

impl JobRunner for SessionRunner {
    fn run(&mut self, job: &EvaluationJob) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut renderer =
            OutputRenderer::new(Arc::clone(&shared.host), job, shared.config.refresh_interval());

        {
            // Checked under the state lock so a restart either sees this
            // job as active or this job sees the restart.
            let mut state = lock(&shared.state);
            if job.generation != shared.generation.load(Ordering::SeqCst) {
                drop(state);
                renderer.finish(JobState::KernelRestarted);
                return Ok(());
            }
            state.active = Some(ActiveJob {
                eval_id: job.eval_id,
                document_id: job.document_id.clone(),
                kill: None,
            });
            shared.state_changed.notify_all();
        }

        if job.delayed && shared.wait_start_delay(job.eval_id) {
            let state = match shared.take_signal(job.eval_id) {
                Some(Signal::Interrupted) => JobState::KernelInterrupted,
                _ => JobState::KernelRestarted,
            };
            tracing::debug!("Evaluation {} stopped before it started", job.eval_id);
            renderer.finish(state);
            shared.clear_active(job.eval_id);
            return Ok(());
        }

        renderer.start_clock();
        renderer.refresh();

        let namespace = shared.namespace_for(&job.document_id);
        let namespace_path = shared.store.path_for(&job.document_id);
        let mut observer = SessionObserver {
            shared: &shared,
            eval_id: job.eval_id,
            renderer,
            delta: NamespaceDelta::default(),
            failed: false,
        };

        let outcome = shared.executor.execute(
            ExecutionRequest {
                document_id: job.document_id.as_str(),
                source: &job.source_text,
                namespace: &namespace,
                namespace_path: &namespace_path,
            },
            &mut observer,
        );
        self.finalize(job, outcome, observer)
    }

    fn on_failure(&mut self, job: &EvaluationJob, message: &str) {
        let shared = &*self.shared;
        let mut renderer =
            OutputRenderer::new(Arc::clone(&shared.host), job, shared.config.refresh_interval());
        renderer.push_line(message.to_string());
        renderer.finish(JobState::Error);
        shared.clear_active(job.eval_id);
    }
}

/// Entry point for editor integrations.
///
/// Dropping the controller interrupts whatever is running and stops the
/// dispatcher.
pub struct SessionController {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl SessionController {
    /// Create a session rendering into `host`.
    ///
    /// Fails if the worker binary cannot be found or the state directory
    /// cannot be created.
    pub fn new(config: EngineConfig, host: Arc<dyn DocumentHost>) -> Result<Self> {
        config.validate()?;
        let worker_path = find_worker_binary(config.worker_path.as_deref())?;
        let dirs = StateDirs::new(config.resolve_state_dir())?;
        tracing::debug!(
            "Session using worker {} and state {}",
            worker_path.display(),
            dirs.root.display()
        );

        let shared = Arc::new(Shared {
            executor: ProcessExecutor::new(worker_path, config.poll_interval()),
            store: NamespaceStore::new(&dirs),
            config,
            host,
            queue: Arc::new(JobQueue::new()),
            gate: Arc::new(Gate::new()),
            state: Mutex::new(EvalState::default()),
            state_changed: Condvar::new(),
            namespaces: Mutex::new(FxHashMap::default()),
            touched: Mutex::new(FxHashSet::default()),
            generation: AtomicU64::new(0),
        });

        let dispatcher = Dispatcher::spawn(
            Arc::clone(&shared.queue),
            Arc::clone(&shared.gate),
            SessionRunner {
                shared: Arc::clone(&shared),
            },
        )?;

        Ok(Self {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Queue the code cell enclosing `line` of `doc`.
    ///
    /// Must run where `doc` is owned, on the foreground. Writes the queued
    /// placeholder into `doc` and returns the assigned eval id, or `None`
    /// when there is no code cell at `line` or its body is empty.
    pub fn submit(&self, document_id: &DocumentId, doc: &mut DocumentLines, line: usize) -> Option<u64> {
        self.shared.submit(document_id, doc, line, false)
    }

    /// Like [`SessionController::submit`], but the job waits the configured
    /// start delay before it runs.
    pub fn submit_delayed(
        &self,
        document_id: &DocumentId,
        doc: &mut DocumentLines,
        line: usize,
    ) -> Option<u64> {
        self.shared.submit(document_id, doc, line, true)
    }

    /// Submit from a thread other than the foreground by scheduling the
    /// submission onto the host and waiting for it.
    ///
    /// Must not be called from the host's foreground thread.
    pub fn submit_via_host(&self, document_id: &DocumentId, line: usize, delayed: bool) -> Option<u64> {
        let (tx, rx) = std::sync::mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let id = document_id.clone();
        self.shared.host.schedule(
            document_id,
            Box::new(move |doc| {
                let _ = tx.send(shared.submit(&id, doc, line, delayed));
            }),
        );
        rx.recv().ok().flatten()
    }

    /// Kill the running job and drop everything still queued.
    ///
    /// Returns whether a job was running; if none was, nothing changes.
    pub fn interrupt(&self) -> bool {
        self.shared.interrupt()
    }

    /// Kill the running job, drop the queue, reset eval ids and delete the
    /// namespaces of every document evaluated in this session.
    pub fn restart(&self) {
        self.shared.restart();
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.state).active.is_some()
    }

    /// Eval id of the running job.
    pub fn current_eval_id(&self) -> Option<u64> {
        lock(&self.shared.state).active.as_ref().map(|a| a.eval_id)
    }

    /// Eval id the next submission will get.
    pub fn next_eval_id(&self) -> u64 {
        self.shared.queue.next_eval_id()
    }

    /// Current namespace of a document.
    pub fn namespace(&self, document_id: &DocumentId) -> Namespace {
        self.shared.namespace_for(document_id)
    }

    /// Namespace storage used by this session.
    pub fn store(&self) -> &NamespaceStore {
        &self.shared.store
    }

    /// Block until nothing is queued or running. Returns false on timeout.
    ///
    /// Rendering edits may still be pending on the host afterwards.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.shared.queue.wait_idle(timeout)
    }

    /// Let queued jobs finish, then stop the dispatcher.
    pub fn shutdown(&self) {
        self.shared.queue.shutdown();
        let dispatcher = lock(&self.dispatcher).take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.join();
            tracing::debug!("Session shut down");
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if lock(&self.dispatcher).is_some() {
            self.interrupt();
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_interrupt_trace_points_at_last_line() {
        let trace = interrupt_trace("x = 1\nwhile True:\n    pass\n\n");
        assert_eq!(trace[0], "Traceback (most recent call last):");
        assert_eq!(trace[1], "  Cell line 3, in <cell>");
        assert_eq!(trace[2], "    pass");
        assert_eq!(trace.last().unwrap(), "KeyboardInterrupt");
    }

    #[test]
    fn test_missing_worker_fails_construction() {
        let temp = tempfile::TempDir::new().unwrap();
        let host = Arc::new(crate::render::ForegroundHost::new().unwrap());
        let config = EngineConfig {
            state_dir: Some(temp.path().to_path_buf()),
            worker_path: Some(temp.path().join("no-such-worker")),
            ..EngineConfig::default()
        };
        assert!(matches!(
            SessionController::new(config, host),
            Err(Error::Worker(_))
        ));
    }
}
