//! Terminal color constants for CLI output.

use magma_core::JobState;

pub const RESET: &str = "\x1b[0m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const CYAN: &str = "\x1b[36m";
pub const RED: &str = "\x1b[31m";

/// Color for a status label.
pub fn for_state(state: JobState) -> &'static str {
    match state {
        JobState::Done => GREEN,
        JobState::Error => RED,
        JobState::KernelInterrupted | JobState::KernelRestarted => YELLOW,
        JobState::Queued | JobState::Running => DIM,
    }
}
