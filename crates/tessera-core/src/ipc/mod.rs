//! Inter-process communication with worker processes.
//!
//! This module provides the protocol and the process handles used by the
//! pool to run units in isolated workers.

pub mod protocol;
mod worker;

pub use protocol::{WorkerCommand, WorkerResponse, read_message, write_message};
pub use worker::{WorkerHandle, WorkerKillHandle, WorkerProgram};
