//! Status header of an output block.

use std::fmt;
use std::time::Duration;

/// State shown in a status header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
    KernelInterrupted,
    KernelRestarted,
}

impl JobState {
    /// Label between the second pair of brackets.
    pub fn label(self) -> &'static str {
        match self {
            JobState::Queued | JobState::Running => "*",
            JobState::Done => "Done",
            JobState::Error => "Error",
            JobState::KernelInterrupted => "Kernel_Interrupted",
            JobState::KernelRestarted => "Kernel_Restarted",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }

    /// Parse a label back, `*` meaning running.
    pub fn from_label(label: &str) -> Option<JobState> {
        match label {
            "*" => Some(JobState::Running),
            "Done" => Some(JobState::Done),
            "Error" => Some(JobState::Error),
            "Kernel_Interrupted" => Some(JobState::KernelInterrupted),
            "Kernel_Restarted" => Some(JobState::KernelRestarted),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Prefix shared by every header of one evaluation, e.g. `[3][`.
pub fn status_tag(eval_id: u64) -> String {
    format!("[{}][", eval_id)
}

/// `[{eval_id}][{STATE}] {elapsed:.2} seconds...`, or the queued form.
pub fn status_line(eval_id: u64, state: JobState, elapsed: Duration) -> String {
    match state {
        JobState::Queued => format!("[{}][*] queue...", eval_id),
        _ => format!(
            "[{}][{}] {:.2} seconds...",
            eval_id,
            state.label(),
            elapsed.as_secs_f64()
        ),
    }
}

/// Split a header into its eval id and state.
pub fn parse_status_line(line: &str) -> Option<(u64, JobState)> {
    let rest = line.trim().strip_prefix('[')?;
    let (id, rest) = rest.split_once("][")?;
    let (label, _) = rest.split_once(']')?;
    let eval_id = id.parse().ok()?;
    let state = if line.trim_end().ends_with("queue...") {
        JobState::Queued
    } else {
        JobState::from_label(label)?
    };
    Some((eval_id, state))
}
