//! The submit interface: run a registered unit, through the cache.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheStore;
use crate::error::Result;
use crate::fingerprint::{CallArgs, Fingerprinter, Value};
use crate::pool::WorkerPool;
use crate::registry::RegistryHandle;

/// Runs units by name: registry lookup, fingerprint, cache, pool.
pub struct Executor {
    registry: RegistryHandle,
    pool: Arc<WorkerPool>,
    cache: Arc<CacheStore>,
    /// TTL for results; `None` uses the cache default.
    ttl: Option<Duration>,
}

impl Executor {
    pub fn new(registry: RegistryHandle, pool: Arc<WorkerPool>, cache: Arc<CacheStore>) -> Self {
        Self {
            registry,
            pool,
            cache,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Run `name` with the given arguments.
    ///
    /// Results are cached under a fingerprint salted with the registry's
    /// generation, so nothing computed by older code is returned after a
    /// reload. Units that can't be fingerprinted run uncached.
    pub async fn execute(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<Value> {
        let call = CallArgs {
            args,
            kwargs: kwargs.into_iter().collect(),
        };
        self.execute_call(name, call).await
    }

    pub async fn execute_call(&self, name: &str, call: CallArgs) -> Result<Value> {
        let snapshot = self.registry.snapshot();
        let unit = snapshot.registry.unit(name, call)?;

        let key = match Fingerprinter::new()
            .with_generation(snapshot.generation)
            .fingerprint(&unit)
        {
            Ok(key) => key,
            Err(uncacheable) => {
                tracing::debug!("Running {} without cache: {}", name, uncacheable);
                return self.pool.run_sync(&unit).await;
            }
        };

        let args_json = unit.call().to_json()?;
        let output = self
            .cache
            .get_or_compute(key, self.ttl, || self.pool.run_raw(unit.name(), args_json))
            .await?;
        Ok(serde_json::from_slice(&output)?)
    }
}
