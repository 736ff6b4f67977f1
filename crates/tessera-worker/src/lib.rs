//! Runtime for Tessera worker processes.
//!
//! A worker program builds a [`WorkerRuntime`], registers its units and
//! globals, and serves coordinator commands over stdin/stdout. Logs must go
//! to stderr: stdout carries the IPC stream.

mod runtime;
pub mod units;

pub use runtime::{Invocation, UnitDef, UnitFn, WorkerRuntime};
