//! Configuration for the pool, cache and reload machinery.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths::ProjectDirs;

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker processes.
    pub workers: usize,
    /// Idle workers older than this are retired at checkout.
    pub idle_timeout: Duration,
    /// How long `stop()` waits for in-flight calls before killing workers.
    pub grace_period: Duration,
    /// Worker binary. Resolved via `TESSERA_WORKER_PATH` and friends when unset.
    pub program: Option<PathBuf>,
    /// Unit run once in each worker after it starts.
    pub initializer: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            idle_timeout: Duration::from_secs(600),
            grace_period: Duration::from_secs(5),
            program: None,
            initializer: None,
        }
    }
}

impl PoolConfig {
    /// Pool with `workers` processes and otherwise default settings.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("pool needs at least one worker".to_string()));
        }
        Ok(())
    }
}

/// Cache store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub directory: PathBuf,
    pub shards: usize,
    /// Upper bound on the summed size of all entries, in bytes.
    pub size_limit: u64,
    /// TTL applied when a caller doesn't pass one. `None` disables expiry.
    pub default_ttl: Option<Duration>,
    /// Discard entries left over from a previous run.
    pub invalidate_on_open: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(".tessera/cache"),
            shards: 4,
            size_limit: 1 << 30,
            default_ttl: Some(Duration::from_secs(300)),
            invalidate_on_open: true,
        }
    }
}

impl CacheConfig {
    pub fn in_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 || self.shards > 256 {
            return Err(Error::Config(format!(
                "cache shard count must be in 1..=256, got {}",
                self.shards
            )));
        }
        Ok(())
    }
}

/// File watching configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// File or directory holding user code.
    pub source: PathBuf,
    /// Optional directory of static assets.
    pub assets: Option<PathBuf>,
    pub debounce: Duration,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("."),
            assets: None,
            debounce: Duration::from_millis(200),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub reload: ReloadConfig,
}

impl TesseraConfig {
    /// Configuration for a project watching `source`, with the cache under
    /// its `.tessera` directory.
    pub fn for_source(source: &Path) -> Self {
        let dirs = ProjectDirs::for_source(source);
        Self {
            pool: PoolConfig::default(),
            cache: CacheConfig::in_directory(dirs.cache_dir),
            reload: ReloadConfig {
                source: source.to_path_buf(),
                ..ReloadConfig::default()
            },
        }
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.cache.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = TesseraConfig::default();
        assert!(config.pool.workers >= 1);
        assert_eq!(config.cache.shards, 4);
        assert_eq!(config.cache.size_limit, 1 << 30);
        assert_eq!(config.cache.default_ttl, Some(Duration::from_secs(300)));
        assert!(config.cache.invalidate_on_open);
        config.validate().unwrap();
    }

    #[test]
    fn test_for_source() {
        let config = TesseraConfig::for_source(Path::new("/srv/tiles/app.py"));
        assert_eq!(config.cache.directory, PathBuf::from("/srv/tiles/.tessera/cache"));
        assert_eq!(config.reload.source, PathBuf::from("/srv/tiles/app.py"));
    }

    #[test]
    fn test_from_json_file_partial() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tessera.json");
        fs::write(
            &path,
            r#"{"pool": {"workers": 2, "initializer": "warmup"}, "cache": {"shards": 8}}"#,
        )
        .unwrap();

        let config = TesseraConfig::from_json_file(&path).unwrap();
        assert_eq!(config.pool.workers, 2);
        assert_eq!(config.pool.initializer.as_deref(), Some("warmup"));
        assert_eq!(config.pool.grace_period, Duration::from_secs(5));
        assert_eq!(config.cache.shards, 8);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tessera.json");
        fs::write(&path, r#"{"pool": {"workers": 0}}"#).unwrap();
        assert!(matches!(
            TesseraConfig::from_json_file(&path),
            Err(Error::Config(_))
        ));
    }
}
