//! A single cache shard: an index of entries stored in one directory.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use rustc_hash::FxHashMap;

use super::entry::{self, CacheEntry, is_expired};
use crate::fingerprint::Fingerprint;

const ENTRY_EXTENSION: &str = "entry";

#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    size: u64,
    expires_at: Option<SystemTime>,
    /// Last-access tick; smaller is older.
    tick: u64,
}

#[derive(Default)]
struct ShardState {
    entries: FxHashMap<Fingerprint, EntryMeta>,
    /// Access order, oldest first.
    lru: BTreeMap<u64, Fingerprint>,
}

impl ShardState {
    fn index(&mut self, key: Fingerprint, meta: EntryMeta) -> Option<EntryMeta> {
        let previous = self.entries.insert(key, meta);
        if let Some(previous) = previous {
            self.lru.remove(&previous.tick);
        }
        self.lru.insert(meta.tick, key);
        previous
    }

    fn unindex(&mut self, key: &Fingerprint) -> Option<EntryMeta> {
        let meta = self.entries.remove(key)?;
        self.lru.remove(&meta.tick);
        Some(meta)
    }
}

/// Result of a shard lookup.
pub(crate) enum Lookup {
    Hit(CacheEntry),
    Miss,
    /// The entry was expired or unreadable and has been dropped.
    Dropped { size: u64 },
}

/// An entry file found while scanning a shard directory.
pub(crate) struct ScannedEntry {
    pub key: Fingerprint,
    pub size: u64,
    pub created_at: SystemTime,
    pub expires_at: Option<SystemTime>,
}

pub(crate) struct Shard {
    dir: PathBuf,
    state: Mutex<ShardState>,
}

impl Shard {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            state: Mutex::new(ShardState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ShardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path(&self, key: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.{}", key.to_hex(), ENTRY_EXTENSION))
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn contains(&self, key: &Fingerprint, now: SystemTime) -> bool {
        self.state()
            .entries
            .get(key)
            .is_some_and(|meta| !is_expired(meta.expires_at, now))
    }

    pub fn get(&self, key: &Fingerprint, tick: u64, now: SystemTime) -> Lookup {
        let mut state = self.state();
        let Some(meta) = state.entries.get(key).copied() else {
            return Lookup::Miss;
        };

        if is_expired(meta.expires_at, now) {
            state.unindex(key);
            remove_file(&self.path(key));
            return Lookup::Dropped { size: meta.size };
        }

        match entry::read(&self.path(key), *key) {
            Ok(entry) => {
                state.index(*key, EntryMeta { tick, ..meta });
                Lookup::Hit(entry)
            }
            Err(e) => {
                tracing::warn!("Dropping unreadable cache entry {}: {}", key, e);
                state.unindex(key);
                remove_file(&self.path(key));
                Lookup::Dropped { size: meta.size }
            }
        }
    }

    /// Store an entry, returning the size of the entry it replaced.
    pub fn put(&self, entry: &CacheEntry, tick: u64) -> io::Result<Option<u64>> {
        let mut state = self.state();
        entry::write(&self.path(&entry.key), entry)?;
        let previous = state.index(
            entry.key,
            EntryMeta {
                size: entry.disk_size(),
                expires_at: entry.expires_at,
                tick,
            },
        );
        Ok(previous.map(|meta| meta.size))
    }

    /// Index an entry already on disk.
    pub fn adopt(&self, scanned: &ScannedEntry, tick: u64) {
        self.state().index(
            scanned.key,
            EntryMeta {
                size: scanned.size,
                expires_at: scanned.expires_at,
                tick,
            },
        );
    }

    pub fn remove(&self, key: &Fingerprint) -> Option<u64> {
        let mut state = self.state();
        let meta = state.unindex(key)?;
        remove_file(&self.path(key));
        Some(meta.size)
    }

    /// Tick of the least recently used entry.
    pub fn oldest_tick(&self) -> Option<u64> {
        self.state().lru.keys().next().copied()
    }

    /// Evict the least recently used entry, returning its key and size.
    pub fn evict_oldest(&self) -> Option<(Fingerprint, u64)> {
        let mut state = self.state();
        let key = *state.lru.values().next()?;
        let meta = state.unindex(&key)?;
        remove_file(&self.path(&key));
        Some((key, meta.size))
    }

    /// Drop every expired entry, returning the count and bytes freed.
    pub fn sweep_expired(&self, now: SystemTime) -> (usize, u64) {
        let mut state = self.state();
        let expired: Vec<Fingerprint> = state
            .entries
            .iter()
            .filter(|(_, meta)| is_expired(meta.expires_at, now))
            .map(|(key, _)| *key)
            .collect();

        let mut freed = 0;
        for key in &expired {
            if let Some(meta) = state.unindex(key) {
                freed += meta.size;
                remove_file(&self.path(key));
            }
        }
        (expired.len(), freed)
    }

    /// Remove every entry and the shard directory contents.
    pub fn clear(&self) -> io::Result<()> {
        let mut state = self.state();
        state.entries.clear();
        state.lru.clear();
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        fs::create_dir_all(&self.dir)
    }

    /// List the live entry files in the shard directory.
    ///
    /// Expired entries, unreadable files and interrupted writes are deleted.
    pub fn scan(&self, now: SystemTime) -> io::Result<Vec<ScannedEntry>> {
        fs::create_dir_all(&self.dir)?;
        let mut found = Vec::new();

        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            let Some(key) = entry_key(&path) else {
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    remove_file(&path);
                }
                continue;
            };

            match entry::read_header(&path) {
                Ok((header, _)) if is_expired(header.expires_at, now) => remove_file(&path),
                Ok((header, size)) => found.push(ScannedEntry {
                    key,
                    size,
                    created_at: header.created_at,
                    expires_at: header.expires_at,
                }),
                Err(e) => {
                    tracing::debug!("Discarding cache file {}: {}", path.display(), e);
                    remove_file(&path);
                }
            }
        }

        Ok(found)
    }
}

fn entry_key(path: &Path) -> Option<Fingerprint> {
    if path.extension()? != ENTRY_EXTENSION {
        return None;
    }
    Fingerprint::from_hex(path.file_stem()?.to_str()?)
}

fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove cache file {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn key(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes([byte; 32])
    }

    #[test]
    fn test_lru_order_follows_access() {
        let dir = tempdir().unwrap();
        let shard = Shard::new(dir.path().to_path_buf());
        let ttl = Some(Duration::from_secs(60));

        shard.put(&CacheEntry::new(key(1), vec![1], ttl), 1).unwrap();
        shard.put(&CacheEntry::new(key(2), vec![2], ttl), 2).unwrap();
        assert_eq!(shard.oldest_tick(), Some(1));

        assert!(matches!(shard.get(&key(1), 3, SystemTime::now()), Lookup::Hit(_)));
        assert_eq!(shard.oldest_tick(), Some(2));

        let (evicted, _) = shard.evict_oldest().unwrap();
        assert_eq!(evicted, key(2));
        assert_eq!(shard.len(), 1);
    }

    #[test]
    fn test_replace_reports_previous_size() {
        let dir = tempdir().unwrap();
        let shard = Shard::new(dir.path().to_path_buf());

        let first = CacheEntry::new(key(1), vec![0; 10], None);
        assert_eq!(shard.put(&first, 1).unwrap(), None);
        let second = CacheEntry::new(key(1), vec![0; 20], None);
        assert_eq!(shard.put(&second, 2).unwrap(), Some(first.disk_size()));
        assert_eq!(shard.len(), 1);
    }

    #[test]
    fn test_scan_skips_junk_and_expired() {
        let dir = tempdir().unwrap();
        let shard = Shard::new(dir.path().to_path_buf());

        shard.put(&CacheEntry::new(key(1), vec![1], None), 1).unwrap();
        let mut stale = CacheEntry::new(key(2), vec![2], None);
        stale.expires_at = Some(SystemTime::now() - Duration::from_secs(10));
        shard.put(&stale, 2).unwrap();
        fs::write(dir.path().join("leftover.tmp"), b"partial").unwrap();
        fs::write(dir.path().join(format!("{}.entry", key(3).to_hex())), b"junk").unwrap();

        let found = shard.scan(SystemTime::now()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, key(1));
        assert!(!dir.path().join("leftover.tmp").exists());
    }
}
