//! Content-addressable cache with single-flight computation.
//!
//! Entries are keyed by [`Fingerprint`], spread over a fixed number of
//! shards, and persisted under the cache directory:
//!
//! ```text
//! <cache_dir>/
//! ├── .gitignore
//! ├── 00/<hex>.entry
//! └── 01/<hex>.entry ...
//! ```
//!
//! The summed entry size is bounded; before a write would push it over the
//! limit the least recently used entries across all shards are evicted.
//! Writes are serialized so the bound holds at every point, not only once
//! concurrent writers settle.

mod entry;
mod lock;
mod shard;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::paths::write_gitignore_marker;

pub use entry::CacheEntry;
pub use lock::{AdvisoryLocks, LockGuard};

use shard::{Lookup, Shard};

/// Lock expiry used when neither the caller nor the config supplies a TTL.
const FALLBACK_LOCK_EXPIRY: Duration = Duration::from_secs(300);

/// Sharded, size-bounded, TTL-aware cache store.
pub struct CacheStore {
    config: CacheConfig,
    shards: Vec<Shard>,
    total_size: AtomicU64,
    /// Held across eviction, insertion and size accounting.
    writes: Mutex<()>,
    /// Monotonic access clock for LRU ordering.
    clock: AtomicU64,
    locks: AdvisoryLocks,
}

impl CacheStore {
    /// Open the store in `config.directory`, creating it if needed.
    ///
    /// Leftover entries are discarded when `invalidate_on_open` is set;
    /// otherwise they're indexed, oldest first.
    pub fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        write_gitignore_marker(&config.directory)?;

        let shards: Vec<Shard> = (0..config.shards)
            .map(|i| Shard::new(config.directory.join(format!("{:02}", i))))
            .collect();

        let store = Self {
            config,
            shards,
            total_size: AtomicU64::new(0),
            writes: Mutex::new(()),
            clock: AtomicU64::new(0),
            locks: AdvisoryLocks::new(),
        };

        if store.config.invalidate_on_open {
            store.clear()?;
        } else {
            store.rebuild_index()?;
        }

        tracing::info!(
            "Opened cache at {} ({} entries, {} bytes)",
            store.config.directory.display(),
            store.len(),
            store.total_size()
        );
        Ok(store)
    }

    fn rebuild_index(&self) -> Result<()> {
        let now = SystemTime::now();
        let mut scanned = Vec::new();
        for (index, shard) in self.shards.iter().enumerate() {
            for entry in shard.scan(now)? {
                // Entries written with a different shard count land elsewhere.
                let owner = self.shard_index(&entry.key);
                if owner != index {
                    self.shards[index].adopt(&entry, 0);
                    self.shards[index].remove(&entry.key);
                    continue;
                }
                scanned.push(entry);
            }
        }

        scanned.sort_by_key(|entry| entry.created_at);
        for entry in &scanned {
            self.shard(&entry.key).adopt(entry, self.tick());
            self.total_size.fetch_add(entry.size, Ordering::Relaxed);
        }

        let _writing = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        self.make_room(0);
        Ok(())
    }

    fn shard_index(&self, key: &Fingerprint) -> usize {
        key.as_bytes()[0] as usize % self.shards.len()
    }

    fn shard(&self, key: &Fingerprint) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a value. Expired and unreadable entries are misses.
    pub fn get(&self, key: &Fingerprint) -> Option<Vec<u8>> {
        self.get_entry(key).map(|entry| entry.value)
    }

    pub fn get_entry(&self, key: &Fingerprint) -> Option<CacheEntry> {
        match self.shard(key).get(key, self.tick(), SystemTime::now()) {
            Lookup::Hit(entry) => Some(entry),
            Lookup::Miss => None,
            Lookup::Dropped { size } => {
                self.total_size.fetch_sub(size, Ordering::Relaxed);
                tracing::debug!("Cache entry {} expired", key);
                None
            }
        }
    }

    /// Whether a live entry exists for `key`. Doesn't count as an access.
    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.shard(key).contains(key, SystemTime::now())
    }

    /// Store a value. `ttl` of `None` applies the configured default TTL.
    ///
    /// Values larger than the whole cache are not stored.
    pub fn set(&self, key: Fingerprint, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.or(self.config.default_ttl);
        let entry = CacheEntry::new(key, value.to_vec(), ttl);

        if entry.disk_size() > self.config.size_limit {
            tracing::warn!(
                "Not caching {}: {} bytes exceeds the cache size limit",
                key,
                entry.disk_size()
            );
            return Ok(());
        }

        let _writing = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        self.make_room(entry.disk_size());

        let previous = self.shard(&key).put(&entry, self.tick()).map_err(Error::Io)?;
        self.total_size.fetch_add(entry.disk_size(), Ordering::Relaxed);
        if let Some(previous) = previous {
            self.total_size.fetch_sub(previous, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Remove an entry. Returns whether one existed.
    pub fn evict(&self, key: &Fingerprint) -> bool {
        match self.shard(key).remove(key) {
            Some(size) => {
                self.total_size.fetch_sub(size, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Evict least recently used entries until `incoming` more bytes fit
    /// under the size bound. Callers hold `writes`.
    fn make_room(&self, incoming: u64) {
        let limit = self.config.size_limit.saturating_sub(incoming);
        while self.total_size.load(Ordering::Relaxed) > limit {
            let oldest = self
                .shards
                .iter()
                .filter_map(|shard| shard.oldest_tick().map(|tick| (tick, shard)))
                .min_by_key(|(tick, _)| *tick);

            let Some((_, shard)) = oldest else {
                break;
            };
            if let Some((key, size)) = shard.evict_oldest() {
                self.total_size.fetch_sub(size, Ordering::Relaxed);
                tracing::debug!("Evicted {} ({} bytes)", key, size);
            }
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut removed = 0;
        for shard in &self.shards {
            let (count, freed) = shard.sweep_expired(now);
            removed += count;
            self.total_size.fetch_sub(freed, Ordering::Relaxed);
        }
        if removed > 0 {
            tracing::debug!("Swept {} expired cache entries", removed);
        }
        removed
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<()> {
        for shard in &self.shards {
            shard.clear()?;
        }
        self.total_size.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summed on-disk size of all entries, in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    pub fn directory(&self) -> &std::path::Path {
        &self.config.directory
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.config.default_ttl
    }

    pub fn locks(&self) -> &AdvisoryLocks {
        &self.locks
    }

    /// Run `f` while holding the advisory lock `name`.
    ///
    /// The lock expires after `expire` even if `f` is still running.
    pub async fn with_lock<F, Fut, T>(&self, name: &str, expire: Duration, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.locks.acquire(name, expire).await;
        f().await
    }

    /// Return the cached value for `key`, computing and storing it on a miss.
    ///
    /// Concurrent callers for the same key compute at most once: the first
    /// takes the key's lock and computes, the rest wait on the lock and then
    /// find the stored value. Errors from `compute` are returned to the
    /// computing caller and not cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: Fingerprint,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        if let Some(value) = self.get(&key) {
            tracing::trace!("Cache hit for {}", key);
            return Ok(value);
        }

        let expire = ttl
            .or(self.config.default_ttl)
            .unwrap_or(FALLBACK_LOCK_EXPIRY);
        let _guard = self.locks.acquire(&key.lock_key(), expire).await;

        if let Some(value) = self.get(&key) {
            tracing::trace!("Cache hit for {} after waiting on lock", key);
            return Ok(value);
        }

        tracing::debug!("Cache miss for {}, computing", key);
        let value = compute().await?;
        self.set(key, &value, ttl)?;
        Ok(value)
    }
}
