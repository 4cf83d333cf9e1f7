//! Evaluation queue and the single dispatcher thread.
//!
//! All documents share one lane: jobs run in submission order, one at a
//! time, system-wide.

mod dispatcher;
mod gate;
mod queue;

pub use dispatcher::{Dispatcher, JobRunner};
pub use gate::Gate;
pub use queue::{EvaluationJob, JobQueue};
