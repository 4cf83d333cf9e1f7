//! Inter-process communication with magma worker processes.
//!
//! This module provides the protocol and utilities for communicating
//! with the isolated worker process that executes one cell.

pub mod protocol;
mod worker;

pub use protocol::{VariableEntry, WorkerCommand, WorkerResponse, read_message, write_message};
pub use worker::{WorkerHandle, WorkerKillHandle, find_worker_binary};
