//! Core engine for Magma text notebooks.
//!
//! This crate provides:
//! - Cell location in plain text documents
//! - A background job queue with a single dispatcher thread
//! - Statement-by-statement execution in isolated worker processes
//! - Durable per-document namespaces
//! - Throttled output rendering through a foreground document host
//! - Session control: submit, interrupt and restart

pub mod config;
pub mod dispatch;
pub mod document;
pub mod error;
pub mod execute;
pub mod ipc;
pub mod locator;
pub mod namespace;
pub mod paths;
pub mod render;
pub mod script;
pub mod session;

pub use config::EngineConfig;
pub use document::{DocumentId, DocumentLines};
pub use error::{Error, Result};
pub use locator::{
    BlockKind, CellRegion, Direction, Scope, cells, cells_in, locate_cell, strip_outputs,
    strip_outputs_in,
};
pub use namespace::{Namespace, NamespaceDelta, NamespaceStore};
pub use paths::StateDirs;
pub use render::{DocumentHost, ForegroundHost, JobState, parse_status_line};
pub use session::SessionController;
