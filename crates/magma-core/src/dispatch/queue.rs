//! FIFO job queue and the session-wide evaluation counter.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::document::DocumentId;
use crate::locator::CellRegion;

/// One submitted cell evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationJob {
    pub document_id: DocumentId,
    pub source_text: String,
    /// Region of the cell when it was submitted.
    pub region: CellRegion,
    pub eval_id: u64,
    /// Wait the configured start delay before running.
    pub delayed: bool,
    /// Restart generation the job was submitted in.
    pub generation: u64,
}

enum QueueItem {
    Job(EvaluationJob),
    Shutdown,
}

struct QueueState {
    pending: VecDeque<QueueItem>,
    next_eval_id: u64,
    /// Jobs taken by the dispatcher and not yet finished.
    in_flight: usize,
    closed: bool,
}

/// Jobs waiting for the dispatcher, guarded together with the counter.
pub struct JobQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                next_eval_id: 1,
                in_flight: 0,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panicking job never holds this lock, so poisoning is harmless
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Assign the next id and enqueue the job built for it, atomically.
    ///
    /// `build` runs under the queue lock, so ids reach the queue in order.
    /// Returns `None` once the queue has been shut down.
    pub fn submit(&self, build: impl FnOnce(u64) -> EvaluationJob) -> Option<u64> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let eval_id = state.next_eval_id;
        state.next_eval_id += 1;
        let job = build(eval_id);
        state.pending.push_back(QueueItem::Job(job));
        self.changed.notify_all();
        Some(eval_id)
    }

    /// Block until the next job; `None` means shut down.
    ///
    /// A returned job counts as in flight until [`JobQueue::finish`].
    pub fn pop(&self) -> Option<EvaluationJob> {
        let mut state = self.lock();
        loop {
            match state.pending.pop_front() {
                Some(QueueItem::Job(job)) => {
                    state.in_flight += 1;
                    return Some(job);
                }
                Some(QueueItem::Shutdown) => {
                    self.changed.notify_all();
                    return None;
                }
                None => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    /// Mark a popped job as finished.
    pub fn finish(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        self.changed.notify_all();
    }

    /// Remove and return all pending jobs, keeping a queued shutdown.
    pub fn drain(&self) -> Vec<EvaluationJob> {
        let mut state = self.lock();
        let mut jobs = Vec::new();
        let mut shutdown = false;
        for item in state.pending.drain(..) {
            match item {
                QueueItem::Job(job) => jobs.push(job),
                QueueItem::Shutdown => shutdown = true,
            }
        }
        if shutdown {
            state.pending.push_back(QueueItem::Shutdown);
        }
        self.changed.notify_all();
        jobs
    }

    /// Restart numbering at 1.
    pub fn reset_counter(&self) {
        self.lock().next_eval_id = 1;
    }

    /// Id the next submission will get.
    pub fn next_eval_id(&self) -> u64 {
        self.lock().next_eval_id
    }

    /// Reject further submissions and stop the dispatcher after the jobs
    /// already queued.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            state.pending.push_back(QueueItem::Shutdown);
            self.changed.notify_all();
        }
    }

    /// Wait until nothing is pending or in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            let busy = state.in_flight > 0
                || state
                    .pending
                    .iter()
                    .any(|item| matches!(item, QueueItem::Job(_)));
            if !busy {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::locate_cell;
    use std::sync::Arc;
    use std::thread;

    fn job(eval_id: u64) -> EvaluationJob {
        let lines = ["<cell>", "x = 1", "</cell>"];
        EvaluationJob {
            document_id: DocumentId::new("doc"),
            source_text: "x = 1".to_string(),
            region: locate_cell(&lines, 1).unwrap(),
            eval_id,
            delayed: false,
            generation: 0,
        }
    }

    #[test]
    fn test_ids_in_submission_order() {
        let queue = JobQueue::new();
        assert_eq!(queue.submit(job), Some(1));
        assert_eq!(queue.submit(job), Some(2));
        assert_eq!(queue.next_eval_id(), 3);

        assert_eq!(queue.pop().unwrap().eval_id, 1);
        assert_eq!(queue.pop().unwrap().eval_id, 2);
    }

    #[test]
    fn test_drain_keeps_counter() {
        let queue = JobQueue::new();
        queue.submit(job);
        queue.submit(job);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.drain().is_empty());
        assert_eq!(queue.submit(job), Some(3));

        queue.reset_counter();
        assert_eq!(queue.next_eval_id(), 1);
    }

    #[test]
    fn test_shutdown_after_pending_jobs() {
        let queue = JobQueue::new();
        queue.submit(job);
        queue.shutdown();

        assert_eq!(queue.submit(job), None);
        assert!(queue.pop().is_some());
        queue.finish();
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_drain_keeps_shutdown() {
        let queue = JobQueue::new();
        queue.submit(job);
        queue.shutdown();
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_pop_blocks_until_submit() {
        let queue = Arc::new(JobQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop().map(|j| j.eval_id))
        };
        thread::sleep(Duration::from_millis(20));
        queue.submit(job);
        assert_eq!(consumer.join().unwrap(), Some(1));
    }

    #[test]
    fn test_wait_idle_tracks_in_flight() {
        let queue = JobQueue::new();
        assert!(queue.wait_idle(Duration::from_millis(1)));

        queue.submit(job);
        assert!(!queue.wait_idle(Duration::from_millis(10)));
        queue.pop();
        assert!(!queue.wait_idle(Duration::from_millis(10)));
        queue.finish();
        assert!(queue.wait_idle(Duration::from_millis(10)));
    }
}
