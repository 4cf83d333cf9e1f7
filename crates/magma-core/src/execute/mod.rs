//! Incremental, process-isolated cell execution.
//!
//! # Architecture
//!
//! ```text
//! ProcessExecutor (parent)
//!     │
//!     └── WorkerHandle (one child process per job)
//!             │
//!             ├── IPC: Run command (source, namespace snapshot, imports)
//!             │       └── magma-worker: run_job
//!             │               └── StatementLoop → Interpreter, one unit at a time
//!             │
//!             ├── IPC: Output / Delta / Failure responses, then Done
//!             │
//!             └── SIGKILL for immediate interruption
//! ```
//!
//! The worker checkpoints the namespace file after every statement that
//! changed it, before reporting the change, so killing it never loses more
//! than the statement in progress.

mod child;
mod process;
mod statements;

pub use child::{ChildConsole, JobRequest, run_job};
pub use process::{ExecutionRequest, JobEvent, JobObserver, JobOutcome, ProcessExecutor};
pub use statements::StatementLoop;
