//! Output rendering into the host document.

mod host;
mod renderer;
mod status;

pub use host::{DocumentHost, Edit, ForegroundHost};
pub use renderer::{OutputRenderer, write_placeholder};
pub use status::{JobState, parse_status_line, status_line, status_tag};
