//! Session tests against the real `magma-worker` binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use magma_core::locator::{OUTPUT_CLOSE, OUTPUT_OPEN, cells};
use magma_core::{
    DocumentId, DocumentLines, EngineConfig, ForegroundHost, JobState, SessionController,
    parse_status_line,
};
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

/// A session rendering into one in-memory document.
struct Fixture {
    session: SessionController,
    host: Arc<ForegroundHost>,
    id: DocumentId,
    state_dir: PathBuf,
    _temp_dir: TempDir,
}

fn config(state_dir: PathBuf) -> EngineConfig {
    EngineConfig {
        state_dir: Some(state_dir),
        worker_path: Some(PathBuf::from(env!("CARGO_BIN_EXE_magma-worker"))),
        refresh_interval_ms: 20,
        join_timeout_ms: 5000,
        start_delay_ms: 100,
        ..EngineConfig::default()
    }
}

impl Fixture {
    fn new(text: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self::with_state_dir(text, temp_dir.path().join("state"), temp_dir)
    }

    fn with_state_dir(text: &str, state_dir: PathBuf, temp_dir: TempDir) -> Self {
        Self::with_config(text, config(state_dir), temp_dir)
    }

    fn with_start_delay(text: &str, start_delay_ms: u64) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = EngineConfig {
            start_delay_ms,
            ..config(temp_dir.path().join("state"))
        };
        Self::with_config(text, config, temp_dir)
    }

    fn with_config(text: &str, config: EngineConfig, temp_dir: TempDir) -> Self {
        let host = Arc::new(ForegroundHost::new().expect("Failed to start host"));
        let id = DocumentId::new("notes.txt");
        host.open(id.clone(), DocumentLines::from_text(text)).unwrap();
        let state_dir = config.state_dir.clone().expect("state dir");
        let session =
            SessionController::new(config, host.clone()).expect("Failed to create session");
        Self {
            session,
            host,
            id,
            state_dir,
            _temp_dir: temp_dir,
        }
    }

    fn submit(&self, line: usize) -> Option<u64> {
        self.session.submit_via_host(&self.id, line, false)
    }

    /// Submit the `n`th code cell, counted from zero.
    fn submit_cell(&self, n: usize) -> Option<u64> {
        let start = self
            .host
            .with_document(&self.id, move |lines| cells(lines.as_slice())[n].start_line)
            .unwrap();
        self.submit(start)
    }

    fn wait(&self) {
        assert!(
            self.session.wait_idle(Duration::from_secs(30)),
            "session did not become idle"
        );
        self.host.flush().unwrap();
    }

    fn lines(&self) -> DocumentLines {
        self.host.lines(&self.id).unwrap()
    }

    /// Status and body of the output block of the `n`th code cell.
    fn output(&self, n: usize) -> (u64, JobState, Vec<String>) {
        let lines = self.lines();
        let cell = &cells(lines.as_slice())[n];
        let open = cell.end_line + 2;
        assert_eq!(lines[open], OUTPUT_OPEN, "document:\n{}", lines.to_text());
        let close = (open..lines.len())
            .find(|&i| lines[i] == OUTPUT_CLOSE)
            .expect("unterminated output block");
        let (eval_id, state) = parse_status_line(&lines[open + 1]).expect("status header");
        (eval_id, state, lines[open + 2..close].to_vec())
    }

    fn variable(&self, name: &str) -> Option<String> {
        self.session
            .namespace(&self.id)
            .variables
            .get(name)
            .map(|v| v.repr())
    }
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

// =============================================================================
// Execution
// =============================================================================

#[test]
fn test_print_and_done_status() {
    let fixture = Fixture::new("<cell>\nx = 1\nprint(x)\n</cell>\n");
    assert_eq!(fixture.submit(1), Some(1));
    fixture.wait();

    let (eval_id, state, body) = fixture.output(0);
    assert_eq!(eval_id, 1);
    assert_eq!(state, JobState::Done);
    assert_eq!(body, vec!["1"]);
    assert_eq!(fixture.variable("x").as_deref(), Some("1"));
}

#[test]
fn test_error_keeps_earlier_bindings() {
    let fixture = Fixture::new("<cell>\nx = 1\n1/0\nprint(x)\ny = 2\n</cell>\n");
    fixture.submit(2);
    fixture.wait();

    let (_, state, body) = fixture.output(0);
    assert_eq!(state, JobState::Error);
    assert!(body.iter().any(|l| l.contains("Cell line 2")), "body: {:?}", body);
    assert!(body.last().unwrap().starts_with("ZeroDivisionError"));
    assert_eq!(fixture.variable("x").as_deref(), Some("1"));
    assert_eq!(fixture.variable("y"), None);
}

#[test]
fn test_empty_cell_is_ignored() {
    let text = "<cell>\n\n   \n</cell>\n";
    let fixture = Fixture::new(text);
    assert_eq!(fixture.submit(1), None);
    fixture.wait();

    assert_eq!(fixture.host.text(&fixture.id).unwrap(), text);
    assert_eq!(fixture.session.next_eval_id(), 1);
}

#[test]
fn test_outside_cell_is_ignored() {
    let fixture = Fixture::new("intro\n<cell>\nx = 1\n</cell>\n");
    assert_eq!(fixture.submit(0), None);
    assert_eq!(fixture.session.next_eval_id(), 1);
}

#[test]
fn test_back_to_back_submissions() {
    let fixture = Fixture::new(
        "<cell>\nimport time\ntime.sleep(0.5)\nprint('first')\n</cell>\n<cell>\nprint('second')\n</cell>\n",
    );
    assert_eq!(fixture.submit_cell(0), Some(1));
    assert_eq!(fixture.submit_cell(1), Some(2));

    // The second job waits behind the first
    let (eval_id, state, _) = fixture.output(1);
    assert_eq!((eval_id, state), (2, JobState::Queued));

    fixture.wait();
    let (first_id, first_state, first_body) = fixture.output(0);
    let (second_id, second_state, second_body) = fixture.output(1);
    assert_eq!((first_id, first_state), (1, JobState::Done));
    assert_eq!((second_id, second_state), (2, JobState::Done));
    assert_eq!(first_body, vec!["first"]);
    assert_eq!(second_body, vec!["second"]);
}

#[test]
fn test_printed_markers_do_not_break_document() {
    let fixture = Fixture::new(
        "<cell>\nprint('</output>')\nprint('<cell>')\n</cell>\n<cell>\nx = 1\n</cell>\n",
    );
    fixture.submit_cell(0);
    fixture.wait();

    let (_, state, body) = fixture.output(0);
    assert_eq!(state, JobState::Done);
    assert_eq!(body, vec!["\\</output>", "\\<cell>"]);

    // Later submissions still find their cells
    assert_eq!(fixture.submit_cell(1), Some(2));
    fixture.wait();
    assert_eq!(fixture.output(1).1, JobState::Done);
    assert_eq!(fixture.variable("x").as_deref(), Some("1"));
}

#[test]
fn test_rerun_replaces_output() {
    let fixture = Fixture::new("<cell>\nprint('hello')\n</cell>\n");
    fixture.submit(1);
    fixture.wait();
    fixture.submit(1);
    fixture.wait();

    let text = fixture.host.text(&fixture.id).unwrap();
    assert_eq!(text.matches(OUTPUT_OPEN).count(), 1);
    let (eval_id, state, body) = fixture.output(0);
    assert_eq!((eval_id, state), (2, JobState::Done));
    assert_eq!(body, vec!["hello"]);
}

#[test]
fn test_namespace_survives_sessions() {
    let temp_dir = TempDir::new().unwrap();
    let state_dir = temp_dir.path().join("state");
    {
        let first = Fixture::with_state_dir(
            "<cell>\nx = 41\n</cell>\n",
            state_dir.clone(),
            TempDir::new().unwrap(),
        );
        first.submit(1);
        first.wait();
    }

    let second = Fixture::with_state_dir("<cell>\nprint(x + 1)\n</cell>\n", state_dir, temp_dir);
    second.submit(1);
    second.wait();
    assert_eq!(second.output(0).2, vec!["42"]);
}

// =============================================================================
// Interrupt and restart
// =============================================================================

const LONG_CELL: &str =
    "<cell>\nx = 1\nimport time\nwhile True:\n    time.sleep(0.01)\n</cell>\n<cell>\nprint('never')\n</cell>\n";

#[test]
fn test_interrupt_long_running_cell() {
    let fixture = Fixture::new(LONG_CELL);
    fixture.submit_cell(0);
    fixture.submit_cell(1);

    // Wait until the first statements have been checkpointed
    let store_path = fixture.session.store().path_for(&fixture.id);
    wait_for("checkpoint", || {
        magma_core::namespace::load_from(&store_path)
            .imports
            .iter()
            .any(|l| l == "import time")
    });
    assert!(fixture.session.is_running());
    assert_eq!(fixture.session.current_eval_id(), Some(1));

    let started = Instant::now();
    assert!(fixture.session.interrupt());
    assert!(started.elapsed() < Duration::from_secs(5));
    fixture.wait();

    let (_, state, body) = fixture.output(0);
    assert_eq!(state, JobState::KernelInterrupted);
    assert_eq!(body.last().map(String::as_str), Some("KeyboardInterrupt"));
    assert_eq!(fixture.output(1).1, JobState::KernelInterrupted);

    assert!(!fixture.session.is_running());
    assert_eq!(fixture.variable("x").as_deref(), Some("1"));
}

#[test]
fn test_interrupt_when_idle_does_nothing() {
    let fixture = Fixture::new("<cell>\nx = 1\n</cell>\n");
    assert!(!fixture.session.interrupt());
    fixture.submit(1);
    fixture.wait();
    assert!(!fixture.session.interrupt());
    assert_eq!(fixture.output(0).1, JobState::Done);
}

#[test]
fn test_restart_clears_namespace_and_ids() {
    let fixture = Fixture::new(LONG_CELL);
    fixture.submit_cell(0);
    fixture.submit_cell(1);
    wait_for("running job", || fixture.session.is_running());

    fixture.session.restart();
    fixture.wait();

    assert_eq!(fixture.output(0).1, JobState::KernelRestarted);
    assert_eq!(fixture.output(1).1, JobState::KernelRestarted);
    assert!(fixture.session.store().load(&fixture.id).is_empty());
    assert!(fixture.session.namespace(&fixture.id).is_empty());
    assert_eq!(fixture.session.next_eval_id(), 1);

    // The session keeps working after a restart
    assert_eq!(fixture.submit_cell(1), Some(1));
    fixture.wait();
    assert_eq!(fixture.output(1).1, JobState::Done);
    assert!(fixture.state_dir.join("namespaces").is_dir());
}

#[test]
fn test_ids_reused_after_restart_target_own_cell() {
    let fixture = Fixture::new("<cell>\nprint('a')\n</cell>\n<cell>\nprint('b')\n</cell>\n");
    assert_eq!(fixture.submit_cell(0), Some(1));
    fixture.wait();

    fixture.session.restart();
    assert_eq!(fixture.submit_cell(1), Some(1));
    fixture.wait();

    assert_eq!(fixture.output(0), (1, JobState::Done, vec!["a".to_string()]));
    assert_eq!(fixture.output(1), (1, JobState::Done, vec!["b".to_string()]));
}

#[test]
fn test_interrupt_during_start_delay() {
    let fixture = Fixture::with_start_delay("<cell>\nx = 5\n</cell>\n", 2000);
    assert_eq!(fixture.session.submit_via_host(&fixture.id, 1, true), Some(1));
    wait_for("delayed job", || fixture.session.is_running());

    let started = Instant::now();
    assert!(fixture.session.interrupt());
    assert!(started.elapsed() < Duration::from_secs(2));
    fixture.wait();

    let (_, state, body) = fixture.output(0);
    assert_eq!(state, JobState::KernelInterrupted);
    assert!(body.is_empty(), "body: {:?}", body);
    assert_eq!(fixture.variable("x"), None);
    assert!(!fixture.session.is_running());
}

#[test]
fn test_delayed_submission() {
    let fixture = Fixture::new("<cell>\nprint('late')\n</cell>\n");
    let started = Instant::now();
    fixture.session.submit_via_host(&fixture.id, 1, true);
    fixture.wait();

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(fixture.output(0).2, vec!["late"]);
}
