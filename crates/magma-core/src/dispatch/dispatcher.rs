//! The background thread that runs jobs one at a time.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::Result;

use super::gate::Gate;
use super::queue::{EvaluationJob, JobQueue};

/// Executes the jobs the dispatcher pulls.
pub trait JobRunner: Send + 'static {
    fn run(&mut self, job: &EvaluationJob) -> Result<()>;

    /// Called after `run` failed or panicked.
    fn on_failure(&mut self, job: &EvaluationJob, message: &str);
}

/// Handle to the dispatcher thread.
pub struct Dispatcher {
    handle: JoinHandle<()>,
}

impl Dispatcher {
    /// Start the dispatcher thread.
    pub fn spawn(queue: Arc<JobQueue>, gate: Arc<Gate>, runner: impl JobRunner) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("magma-dispatcher".to_string())
            .spawn(move || dispatch_loop(&queue, &gate, runner))?;
        Ok(Self { handle })
    }

    /// Wait for the loop to exit after a shutdown.
    pub fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("Dispatcher thread panicked");
        }
    }
}

fn dispatch_loop(queue: &JobQueue, gate: &Gate, mut runner: impl JobRunner) {
    tracing::debug!("Dispatcher started");
    while let Some(job) = queue.pop() {
        gate.wait_open();

        let message = match panic::catch_unwind(AssertUnwindSafe(|| runner.run(&job))) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.with_hint()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };

        if let Some(message) = message {
            tracing::error!("Job {} for {} failed: {}", job.eval_id, job.document_id, message);
            let reported = panic::catch_unwind(AssertUnwindSafe(|| runner.on_failure(&job, &message)));
            if reported.is_err() {
                tracing::error!("Reporting the failure of job {} panicked", job.eval_id);
            }
        }
        queue.finish();
    }
    tracing::debug!("Dispatcher stopped");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentId;
    use crate::error::Error;
    use crate::locator::locate_cell;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<String>>>);

    impl Log {
        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl JobRunner for Log {
        fn run(&mut self, job: &EvaluationJob) -> Result<()> {
            match job.source_text.as_str() {
                "panic" => panic!("boom"),
                "fail" => Err(Error::Ipc("bad job".to_string())),
                _ => {
                    self.0.lock().unwrap().push(format!("ran {}", job.eval_id));
                    Ok(())
                }
            }
        }

        fn on_failure(&mut self, job: &EvaluationJob, message: &str) {
            self.0
                .lock()
                .unwrap()
                .push(format!("failed {}: {}", job.eval_id, message));
        }
    }

    fn submit(queue: &JobQueue, source: &str) {
        let lines = vec!["<cell>".to_string(), source.to_string(), "</cell>".to_string()];
        queue.submit(|eval_id| EvaluationJob {
            document_id: DocumentId::new("doc"),
            source_text: source.to_string(),
            region: locate_cell(&lines, 1).unwrap(),
            eval_id,
            delayed: false,
            generation: 0,
        });
    }

    #[test]
    fn test_failures_do_not_stop_the_loop() {
        let queue = Arc::new(JobQueue::new());
        let gate = Arc::new(Gate::new());
        let log = Log::default();

        submit(&queue, "ok");
        submit(&queue, "panic");
        submit(&queue, "fail");
        submit(&queue, "ok");
        queue.shutdown();

        let dispatcher = Dispatcher::spawn(Arc::clone(&queue), gate, log.clone()).unwrap();
        dispatcher.join();

        let entries = log.entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0], "ran 1");
        assert!(entries[1].starts_with("failed 2: panicked: boom"));
        assert!(entries[2].contains("bad job"));
        assert_eq!(entries[3], "ran 4");
    }

    #[test]
    fn test_closed_gate_holds_jobs() {
        let queue = Arc::new(JobQueue::new());
        let gate = Arc::new(Gate::new());
        let log = Log::default();
        gate.close();

        let dispatcher =
            Dispatcher::spawn(Arc::clone(&queue), Arc::clone(&gate), log.clone()).unwrap();
        submit(&queue, "ok");
        std::thread::sleep(Duration::from_millis(50));
        assert!(log.entries().is_empty());

        gate.open();
        assert!(queue.wait_idle(Duration::from_secs(5)));
        assert_eq!(log.entries(), vec!["ran 1"]);

        queue.shutdown();
        dispatcher.join();
    }
}
