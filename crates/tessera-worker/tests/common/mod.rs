//! Shared setup for tests that drive real worker processes.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use tessera_core::{ComputationUnit, FunctionDescriptor, PoolConfig, WorkerProgram};

pub fn worker_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_tessera-worker"))
}

pub fn program() -> WorkerProgram {
    WorkerProgram::new(worker_path())
}

pub fn pool_config(workers: usize) -> PoolConfig {
    PoolConfig {
        workers,
        program: Some(worker_path()),
        grace_period: Duration::from_secs(2),
        ..PoolConfig::default()
    }
}

/// Unit bound to one of the worker's built-ins.
pub fn builtin(name: &str) -> ComputationUnit {
    ComputationUnit::standalone(FunctionDescriptor::new(name, format!("{}/v1", name)))
}

pub fn pid_of(value: tessera_core::Result<tessera_core::Value>) -> i64 {
    value
        .expect("worker_id failed")
        .as_i64()
        .expect("worker_id returns an integer")
}
