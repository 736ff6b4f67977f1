//! Hot reload: swapping user code under a running pool.
//!
//! On a source change the coordinator loads a fresh registry, stops the
//! pool, publishes the registry as a new generation while no worker is
//! running, starts the pool on the new code, and only then fires
//! `code_reloaded`. Anyone awaiting [`ReloadCoordinator::next_reload`] is
//! therefore never told about new code before workers run it.

mod loader;
mod signal;

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::pool::WorkerPool;
use crate::registry::{RegistryHandle, UnitRegistry};
use crate::watcher::{FileWatcher, WatchRoot};

pub use loader::{UnitLoader, WorkerCatalogLoader};
pub use signal::{ReloadSignal, ReloadWaiter};

pub struct ReloadCoordinator {
    loader: Arc<dyn UnitLoader>,
    registry: RegistryHandle,
    pool: Arc<WorkerPool>,
    code_reloaded: ReloadSignal,
    assets_changed: ReloadSignal,
    /// Serializes reloads triggered back to back.
    reload_lock: AsyncMutex<()>,
}

impl ReloadCoordinator {
    /// Load the initial registry and build a coordinator around `pool`.
    ///
    /// The pool is not started here.
    pub async fn new(loader: Arc<dyn UnitLoader>, pool: Arc<WorkerPool>) -> Result<Self> {
        let initial = load(&loader).await?;
        tracing::info!("Loaded {} units", initial.len());
        Ok(Self {
            loader,
            registry: RegistryHandle::new(initial),
            pool,
            code_reloaded: ReloadSignal::new(),
            assets_changed: ReloadSignal::new(),
            reload_lock: AsyncMutex::new(()),
        })
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn generation(&self) -> u64 {
        self.registry.generation()
    }

    /// Fired after each successful reload, once the pool runs the new code.
    pub fn code_reloaded(&self) -> &ReloadSignal {
        &self.code_reloaded
    }

    pub fn assets_changed(&self) -> &ReloadSignal {
        &self.assets_changed
    }

    /// Resolves after the next successful reload with the registry
    /// generation it published, the same number [`Self::generation`]
    /// reports. A reload whose pool failed to restart published a generation
    /// without firing, so the next firing may skip a number.
    pub fn next_reload(&self) -> impl Future<Output = u64> + Send + 'static {
        self.code_reloaded.wait()
    }

    /// Reload user code and restart the pool on it.
    ///
    /// A failed load leaves the current code and pool untouched. Returns the
    /// new generation.
    pub async fn on_source_changed(&self) -> Result<u64> {
        let _reloading = self.reload_lock.lock().await;

        let fresh = match load(&self.loader).await {
            Ok(registry) => registry,
            Err(e) => {
                tracing::error!("Reload failed, keeping generation {}: {}", self.generation(), e);
                return Err(e);
            }
        };
        let units = fresh.len();

        let mut fresh = Some(fresh);
        let restarted = self
            .pool
            .restart_with(|| fresh.take().map(|registry| self.registry.publish(registry)))
            .await;

        let generation = match restarted {
            Ok(Some(generation)) => generation,
            // No running pool: publishing is all there is to do.
            Ok(None) | Err(Error::PoolClosed) => match fresh.take() {
                Some(registry) => {
                    tracing::debug!("Pool is not running; publishing without a restart");
                    self.registry.publish(registry)
                }
                None => self.registry.generation(),
            },
            Err(e) => {
                tracing::error!("Pool failed to restart after reload: {}", e);
                return Err(e);
            }
        };

        tracing::info!("Reloaded {} units as generation {}", units, generation);
        self.code_reloaded.fire_at(generation);
        Ok(generation)
    }

    /// Report an asset change. Doesn't touch code or the pool.
    pub fn on_assets_changed(&self) {
        self.assets_changed.fire();
    }

    /// Consume watcher events until the watcher closes.
    pub async fn run(&self, mut watcher: FileWatcher) {
        while let Some(event) = watcher.recv().await {
            tracing::debug!("Change detected in {}", event.path.display());
            match event.root {
                WatchRoot::Source => {
                    // Failures are logged inside; the next edit retries.
                    let _ = self.on_source_changed().await;
                }
                WatchRoot::Assets => self.on_assets_changed(),
            }
        }
        tracing::info!("File watcher closed, reload loop exiting");
    }
}

async fn load(loader: &Arc<dyn UnitLoader>) -> Result<UnitRegistry> {
    let loader = Arc::clone(loader);
    tokio::task::spawn_blocking(move || loader.load())
        .await
        .map_err(|e| Error::InvalidOperation(format!("unit loader task failed: {}", e)))?
}
