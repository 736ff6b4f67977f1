//! One generation of worker processes.
//!
//! An `ActivePool` is started once, serves calls while `Running`, and is
//! drained once. Restarting the `WorkerPool` replaces it with a new one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tokio::sync::Semaphore;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::ipc::{WorkerHandle, WorkerKillHandle, WorkerProgram};

use super::state::{AtomicPoolState, PoolState};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct WorkerSlot {
    handle: WorkerHandle,
    idle_since: Instant,
}

impl WorkerSlot {
    fn new(handle: WorkerHandle) -> Self {
        Self {
            handle,
            idle_since: Instant::now(),
        }
    }
}

/// Per-call cancellation state shared between the caller and the blocking
/// task driving the worker.
#[derive(Default)]
struct CallState {
    cancelled: AtomicBool,
    worker: Mutex<Option<WorkerKillHandle>>,
}

impl CallState {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(worker) = lock(&self.worker).as_ref() {
            tracing::debug!("Call cancelled, killing worker {}", worker.pid());
            worker.kill();
        }
    }

    /// Record the worker running this call. Returns false if the call was
    /// already cancelled.
    fn attach(&self, worker: WorkerKillHandle) -> bool {
        let mut slot = lock(&self.worker);
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        *slot = Some(worker);
        true
    }

    /// Forget the worker once the call is over. A later `cancel` must not
    /// kill a worker that has gone back to the pool.
    fn detach(&self) {
        lock(&self.worker).take();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cancels the call if the caller's future is dropped before completion.
struct CancelOnDrop {
    call: Arc<CallState>,
    armed: bool,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.call.cancel();
        }
    }
}

/// Snapshot of a pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub id: u64,
    pub state: PoolState,
    pub capacity: usize,
    pub idle: usize,
    pub busy: usize,
}

pub(crate) struct ActivePool {
    id: u64,
    config: PoolConfig,
    program: WorkerProgram,
    state: AtomicPoolState,
    limiter: Arc<Semaphore>,
    idle: Mutex<Vec<WorkerSlot>>,
    /// Workers currently executing a call, by pid.
    busy: Mutex<FxHashMap<u32, WorkerKillHandle>>,
}

impl ActivePool {
    /// Spawn and warm up every worker, then mark the pool `Running`.
    ///
    /// If any worker fails to start, the ones already started are killed and
    /// the error is returned.
    pub async fn launch(id: u64, config: PoolConfig, program: WorkerProgram) -> Result<Arc<Self>> {
        config.validate()?;
        let workers = config.workers;
        let started = Instant::now();

        let pool = Arc::new(Self {
            id,
            limiter: Arc::new(Semaphore::new(workers)),
            config,
            program,
            state: AtomicPoolState::new(PoolState::Starting),
            idle: Mutex::new(Vec::with_capacity(workers)),
            busy: Mutex::new(FxHashMap::default()),
        });

        let spawns = (0..workers).map(|_| {
            let pool = Arc::clone(&pool);
            async move {
                tokio::task::spawn_blocking(move || pool.spawn_worker())
                    .await
                    .map_err(|e| Error::Spawn(format!("worker spawn task failed: {}", e)))?
            }
        });
        let handles = match futures::future::try_join_all(spawns).await {
            Ok(handles) => handles,
            Err(e) => {
                pool.state.set(PoolState::Closed);
                tracing::error!("Pool {} failed to start: {}", id, e);
                return Err(e);
            }
        };

        lock(&pool.idle).extend(handles.into_iter().map(WorkerSlot::new));
        pool.state.set(PoolState::Running);
        tracing::info!(
            "Pool {} running with {} workers (started in {:?})",
            id,
            workers,
            started.elapsed()
        );
        Ok(pool)
    }

    /// Spawn one worker and run the initializer in it.
    fn spawn_worker(&self) -> Result<WorkerHandle> {
        let mut handle = WorkerHandle::spawn(&self.program)?;
        if let Some(initializer) = &self.config.initializer {
            handle.execute(initializer, Vec::new()).map_err(|e| {
                Error::Spawn(format!(
                    "initializer {} failed in worker {}: {}",
                    initializer,
                    handle.pid(),
                    e
                ))
            })?;
        }
        Ok(handle)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> PoolState {
        self.state.get()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            id: self.id,
            state: self.state.get(),
            capacity: self.config.workers,
            idle: lock(&self.idle).len(),
            busy: lock(&self.busy).len(),
        }
    }

    /// Run `unit` on a worker, returning its output JSON.
    ///
    /// Dropping the returned future kills the worker executing the call.
    pub async fn run(self: &Arc<Self>, unit: String, args_json: Vec<u8>) -> Result<Vec<u8>> {
        let permit = Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed)?;
        if self.state.get() != PoolState::Running {
            return Err(Error::PoolClosed);
        }

        let call = Arc::new(CallState::default());
        let guard = CancelOnDrop {
            call: Arc::clone(&call),
            armed: true,
        };

        let pool = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || {
            // Capacity returns only after the slot is checked back in.
            let _permit = permit;
            pool.run_blocking(&call, &unit, args_json)
        })
        .await;
        guard.disarm();

        result.map_err(|e| Error::Execution(format!("worker task failed: {}", e)))?
    }

    fn run_blocking(&self, call: &CallState, unit: &str, args_json: Vec<u8>) -> Result<Vec<u8>> {
        let mut slot = self.checkout()?;

        if !call.attach(slot.handle.kill_handle()) {
            self.checkin(slot);
            return Err(Error::Aborted);
        }

        let result = match slot.handle.execute(unit, args_json) {
            Err(Error::WorkerCrashed { .. })
                if slot.handle.was_killed()
                    && (call.is_cancelled() || self.state.get() != PoolState::Running) =>
            {
                Err(Error::Aborted)
            }
            Err(Error::WorkerCrashed { pid, message }) => {
                tracing::warn!("Worker {} crashed running {}: {}", pid, unit, message);
                Err(Error::WorkerCrashed { pid, message })
            }
            other => other,
        };

        call.detach();
        self.checkin(slot);
        result
    }

    /// Take an idle worker, retiring stale or dead ones and spawning a fresh
    /// one if none is left.
    fn checkout(&self) -> Result<WorkerSlot> {
        let mut slot = loop {
            let candidate = lock(&self.idle).pop();
            let Some(mut slot) = candidate else {
                tracing::debug!("Pool {} has no idle worker, spawning one", self.id);
                break WorkerSlot::new(self.spawn_worker()?);
            };

            if slot.idle_since.elapsed() > self.config.idle_timeout {
                let pid = slot.handle.pid();
                tracing::debug!("Retiring idle worker {}", pid);
                if let Err(e) = slot.handle.shutdown() {
                    tracing::debug!("Worker {} shutdown: {}", pid, e);
                }
                continue;
            }
            if !slot.handle.is_alive() {
                tracing::debug!("Discarding dead worker {}", slot.handle.pid());
                continue;
            }
            break slot;
        };

        // Register before checking state: drain either sees this worker in
        // `busy` or we see `Draining` here.
        lock(&self.busy).insert(slot.handle.pid(), slot.handle.kill_handle());
        if self.state.get() != PoolState::Running {
            lock(&self.busy).remove(&slot.handle.pid());
            slot.idle_since = Instant::now();
            lock(&self.idle).push(slot);
            return Err(Error::PoolClosed);
        }
        Ok(slot)
    }

    /// Return a worker after a call, replacing it if it died.
    fn checkin(&self, mut slot: WorkerSlot) {
        let pid = slot.handle.pid();
        lock(&self.busy).remove(&pid);

        if slot.handle.is_alive() {
            slot.idle_since = Instant::now();
            lock(&self.idle).push(slot);
            return;
        }

        drop(slot);
        if self.state.get() != PoolState::Running {
            return;
        }
        match self.spawn_worker() {
            Ok(handle) => {
                tracing::info!("Replaced dead worker {} with {}", pid, handle.pid());
                lock(&self.idle).push(WorkerSlot::new(handle));
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to replace dead worker {} ({}); will retry on next checkout",
                    pid,
                    e
                );
            }
        }
    }

    /// Run `unit` once on every idle worker. Waits for in-flight calls first.
    pub async fn run_on_all(
        self: &Arc<Self>,
        unit: String,
        args_json: Vec<u8>,
    ) -> Result<Vec<Result<Vec<u8>>>> {
        let permits = Arc::clone(&self.limiter)
            .acquire_many_owned(self.config.workers as u32)
            .await
            .map_err(|_| Error::PoolClosed)?;
        if self.state.get() != PoolState::Running {
            return Err(Error::PoolClosed);
        }

        let pool = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let _permits = permits;
            let slots = std::mem::take(&mut *lock(&pool.idle));
            let mut results = Vec::with_capacity(slots.len());
            for mut slot in slots {
                results.push(slot.handle.execute(&unit, args_json.clone()));
                pool.checkin(slot);
            }
            results
        })
        .await
        .map_err(|e| Error::Execution(format!("worker task failed: {}", e)))
    }

    /// Stop accepting calls, wait up to `grace` for in-flight ones, kill
    /// whatever is still running, then shut idle workers down.
    pub async fn drain(&self, grace: Duration) {
        self.state.set(PoolState::Draining);
        let workers = self.config.workers as u32;

        let permits = match tokio::time::timeout(grace, self.limiter.acquire_many(workers)).await {
            Ok(permits) => permits.ok(),
            Err(_) => {
                let busy: Vec<WorkerKillHandle> = lock(&self.busy).values().cloned().collect();
                tracing::warn!(
                    "Pool {}: {} calls still running after {:?}, killing their workers",
                    self.id,
                    busy.len(),
                    grace
                );
                for worker in &busy {
                    worker.kill();
                }
                self.limiter.acquire_many(workers).await.ok()
            }
        };
        self.limiter.close();

        let idle = std::mem::take(&mut *lock(&self.idle));
        let count = idle.len();
        let shutdown = tokio::task::spawn_blocking(move || {
            for slot in idle {
                let pid = slot.handle.pid();
                if let Err(e) = slot.handle.shutdown() {
                    tracing::debug!("Worker {} shutdown: {}", pid, e);
                }
            }
        });
        if let Err(e) = shutdown.await {
            tracing::warn!("Worker shutdown task failed: {}", e);
        }

        drop(permits);
        self.state.set(PoolState::Closed);
        tracing::info!("Pool {} closed ({} workers shut down)", self.id, count);
    }
}

impl Drop for ActivePool {
    fn drop(&mut self) {
        // Idle workers are killed by their handles' Drop.
        if self.state.get() != PoolState::Closed {
            tracing::debug!("Pool {} dropped without draining", self.id);
        }
    }
}
