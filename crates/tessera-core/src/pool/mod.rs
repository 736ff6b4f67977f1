//! Pool of isolated worker processes.
//!
//! The `WorkerPool` owns at most one current [`ActivePool`]. Lifecycle
//! operations (`start`, `stop`, `restart`) serialize on an async lifecycle
//! lock; calls only take the current-pool mutex long enough to clone the
//! `Arc`, so a restart never blocks traffic on the old pool and in-flight
//! calls keep their pool alive until they finish.

mod active;
mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Mutex as AsyncMutex;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::fingerprint::{ComputationUnit, Value};
use crate::ipc::WorkerProgram;

use active::ActivePool;

pub use active::PoolStats;
pub use state::PoolState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Fresh,
    Running,
    Stopped,
}

/// Restartable pool of worker processes.
pub struct WorkerPool {
    config: PoolConfig,
    lifecycle: AsyncMutex<Lifecycle>,
    current: Mutex<Option<Arc<ActivePool>>>,
    next_id: AtomicU64,
}

impl WorkerPool {
    /// Create a pool. No worker runs until [`WorkerPool::start`].
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            lifecycle: AsyncMutex::new(Lifecycle::Fresh),
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn current(&self) -> Option<Arc<ActivePool>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn swap(&self, pool: Option<Arc<ActivePool>>) -> Option<Arc<ActivePool>> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, pool)
    }

    async fn launch(&self) -> Result<Arc<ActivePool>> {
        let program = WorkerProgram::resolve(self.config.program.as_deref())?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        ActivePool::launch(id, self.config.clone(), program).await
    }

    /// Spawn and warm up the workers.
    ///
    /// Fails with `InvalidOperation` if the pool is already running; a
    /// stopped pool can be started again.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle == Lifecycle::Running {
            return Err(Error::InvalidOperation(
                "worker pool is already running".to_string(),
            ));
        }

        let pool = self.launch().await?;
        self.swap(Some(pool));
        *lifecycle = Lifecycle::Running;
        Ok(())
    }

    /// Drain and close the current pool. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(pool) = self.swap(None) {
            pool.drain(self.config.grace_period).await;
        }
        if *lifecycle != Lifecycle::Fresh {
            *lifecycle = Lifecycle::Stopped;
        }
    }

    /// Replace the running pool with fresh workers.
    ///
    /// Fails with `PoolClosed` unless the pool is running.
    pub async fn restart(&self) -> Result<()> {
        self.restart_with(|| ()).await
    }

    /// Restart, running `between` after the old workers are gone and before
    /// the new ones start.
    ///
    /// If the new pool fails to start the pool ends up stopped.
    pub async fn restart_with<F, T>(&self, between: F) -> Result<T>
    where
        F: FnOnce() -> T,
    {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle != Lifecycle::Running {
            return Err(Error::PoolClosed);
        }

        if let Some(old) = self.swap(None) {
            tracing::info!("Restarting worker pool {}", old.id());
            old.drain(self.config.grace_period).await;
        }

        let output = between();

        match self.launch().await {
            Ok(pool) => {
                self.swap(Some(pool));
                Ok(output)
            }
            Err(e) => {
                *lifecycle = Lifecycle::Stopped;
                Err(e)
            }
        }
    }

    /// Run `unit` on a worker and return its output.
    ///
    /// Cancelling the returned future kills the worker running the unit.
    pub async fn run_sync(&self, unit: &ComputationUnit) -> Result<Value> {
        let args_json = unit.call().to_json()?;
        let output = self.run_raw(unit.name(), args_json).await?;
        Ok(serde_json::from_slice(&output)?)
    }

    /// Run the unit `name` with pre-encoded arguments, returning output JSON.
    pub async fn run_raw(&self, name: &str, args_json: Vec<u8>) -> Result<Vec<u8>> {
        let pool = self.current().ok_or(Error::PoolClosed)?;
        pool.run(name.to_string(), args_json).await
    }

    /// Run `unit` once on every worker, after in-flight calls finish.
    pub async fn run_on_all(&self, unit: &ComputationUnit) -> Result<Vec<Result<Value>>> {
        let args_json = unit.call().to_json()?;
        let pool = self.current().ok_or(Error::PoolClosed)?;
        let outputs = pool.run_on_all(unit.name().to_string(), args_json).await?;
        Ok(outputs
            .into_iter()
            .map(|output| output.and_then(|bytes| Ok(serde_json::from_slice(&bytes)?)))
            .collect())
    }

    pub fn state(&self) -> PoolState {
        self.current()
            .map(|pool| pool.state())
            .unwrap_or(PoolState::Closed)
    }

    pub fn is_running(&self) -> bool {
        self.state() == PoolState::Running
    }

    pub fn stats(&self) -> Option<PoolStats> {
        self.current().map(|pool| pool.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FunctionDescriptor;

    fn missing_program() -> PoolConfig {
        PoolConfig {
            workers: 2,
            program: Some("/nonexistent/tessera-worker".into()),
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_unstarted_pool_is_closed() {
        let pool = WorkerPool::new(missing_program());
        assert_eq!(pool.state(), PoolState::Closed);
        assert!(pool.stats().is_none());

        let unit = ComputationUnit::standalone(FunctionDescriptor::new("noop", "noop/v1"));
        assert!(matches!(pool.run_sync(&unit).await, Err(Error::PoolClosed)));
        assert!(matches!(pool.restart().await, Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn test_start_fails_without_worker_binary() {
        let pool = WorkerPool::new(missing_program());
        assert!(matches!(pool.start().await, Err(Error::Spawn(_))));
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let pool = WorkerPool::new(missing_program());
        pool.stop().await;
        pool.stop().await;
        assert_eq!(pool.state(), PoolState::Closed);
    }
}
