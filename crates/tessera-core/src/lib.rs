//! Execution and caching core for Tessera per-tile functions.
//!
//! This crate provides:
//! - Deterministic fingerprints for computation units
//! - A sharded, TTL-aware cache with single-flight computation
//! - A restartable pool of isolated worker processes
//! - Hot reload that swaps user code under a running pool

pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod ipc;
pub mod paths;
pub mod pool;
pub mod registry;
pub mod reload;
pub mod watcher;

pub use cache::{AdvisoryLocks, CacheEntry, CacheStore, LockGuard};
pub use config::{CacheConfig, PoolConfig, ReloadConfig, TesseraConfig};
pub use error::{Error, Result};
pub use executor::Executor;
pub use fingerprint::{
    CallArgs, Canonical, ComputationUnit, Fingerprint, Fingerprinter, FunctionDescriptor, Globals,
    OpaqueBlob, OpaqueOrigin, Uncacheable, Value, fingerprint,
};
pub use ipc::{WorkerHandle, WorkerKillHandle, WorkerProgram};
pub use paths::ProjectDirs;
pub use pool::{PoolState, PoolStats, WorkerPool};
pub use registry::{Catalog, RegistryHandle, RegistrySnapshot, UnitRegistry};
pub use reload::{ReloadCoordinator, ReloadSignal, ReloadWaiter, UnitLoader, WorkerCatalogLoader};
pub use watcher::{ChangeEvent, FileWatcher, WatchRoot};
