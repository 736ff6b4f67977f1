//! File watcher producing change notifications for the reload coordinator.
//!
//! Watches the source (a file or a directory) and an optional assets
//! directory. Anything under a `.tessera` directory is ignored so cache
//! writes never look like edits.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use notify_debouncer_mini::{DebounceEventResult, new_debouncer, notify::RecursiveMode};
use tokio::sync::mpsc;

use crate::config::ReloadConfig;
use crate::error::{Error, Result};

/// Which watched root a change belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchRoot {
    Source,
    Assets,
}

/// A debounced change under one of the watched roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub root: WatchRoot,
    pub path: PathBuf,
}

struct Roots {
    /// Set when the source is a single file.
    source_file: Option<PathBuf>,
    source_dir: PathBuf,
    assets: Option<PathBuf>,
}

impl Roots {
    fn classify(&self, path: &Path) -> Option<WatchRoot> {
        if path
            .components()
            .any(|c| matches!(c, Component::Normal(name) if name == ".tessera"))
        {
            return None;
        }
        if let Some(assets) = &self.assets {
            if path.starts_with(assets) {
                return Some(WatchRoot::Assets);
            }
        }
        match &self.source_file {
            Some(file) if path == file => Some(WatchRoot::Source),
            Some(_) => None,
            None if path.starts_with(&self.source_dir) => Some(WatchRoot::Source),
            None => None,
        }
    }
}

/// File watcher handle.
pub struct FileWatcher {
    /// Debouncer handle (kept alive to maintain the watch).
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl FileWatcher {
    pub fn new(config: &ReloadConfig) -> Result<Self> {
        let source = canonical(&config.source)?;
        let (source_file, source_dir) = if source.is_file() {
            let dir = source.parent().unwrap_or(Path::new(".")).to_path_buf();
            (Some(source.clone()), dir)
        } else {
            (None, source.clone())
        };
        let assets = config.assets.as_deref().map(canonical).transpose()?;

        let roots = Arc::new(Roots {
            source_file,
            source_dir,
            assets,
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let handler_roots = Arc::clone(&roots);
        let mut debouncer = new_debouncer(config.debounce, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        let Some(root) = handler_roots.classify(&event.path) else {
                            continue;
                        };
                        let _ = tx.send(ChangeEvent {
                            root,
                            path: event.path,
                        });
                    }
                }
                Err(e) => tracing::warn!("File watch error: {}", e),
            }
        })
        .map_err(|e| Error::Watch(e.to_string()))?;

        let source_mode = if roots.source_file.is_some() {
            RecursiveMode::NonRecursive
        } else {
            RecursiveMode::Recursive
        };
        debouncer
            .watcher()
            .watch(&roots.source_dir, source_mode)
            .map_err(|e| Error::Watch(e.to_string()))?;
        if let Some(assets) = &roots.assets {
            debouncer
                .watcher()
                .watch(assets, RecursiveMode::Recursive)
                .map_err(|e| Error::Watch(e.to_string()))?;
        }

        tracing::info!("Watching {} for changes", roots.source_dir.display());
        Ok(Self {
            _debouncer: debouncer,
            rx,
        })
    }

    /// Receive the next change. Returns `None` once the watcher is gone.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .map_err(|e| Error::Watch(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_classify() {
        let roots = Roots {
            source_file: None,
            source_dir: PathBuf::from("/proj"),
            assets: Some(PathBuf::from("/proj/static")),
        };
        assert_eq!(roots.classify(Path::new("/proj/app.py")), Some(WatchRoot::Source));
        assert_eq!(
            roots.classify(Path::new("/proj/static/logo.png")),
            Some(WatchRoot::Assets)
        );
        assert_eq!(roots.classify(Path::new("/proj/.tessera/cache/00/x.entry")), None);
        assert_eq!(roots.classify(Path::new("/elsewhere/file")), None);
    }

    #[test]
    fn test_classify_single_file() {
        let roots = Roots {
            source_file: Some(PathBuf::from("/proj/app.py")),
            source_dir: PathBuf::from("/proj"),
            assets: None,
        };
        assert_eq!(roots.classify(Path::new("/proj/app.py")), Some(WatchRoot::Source));
        assert_eq!(roots.classify(Path::new("/proj/notes.txt")), None);
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let config = ReloadConfig {
            source: PathBuf::from("/nonexistent/source.py"),
            ..ReloadConfig::default()
        };
        assert!(matches!(FileWatcher::new(&config), Err(Error::Watch(_))));
    }

    #[tokio::test]
    async fn test_reports_source_edit() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("app.py");
        fs::write(&source, "v1").unwrap();

        let config = ReloadConfig {
            source: source.clone(),
            assets: None,
            debounce: Duration::from_millis(50),
        };
        let mut watcher = FileWatcher::new(&config).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(&source, "v2").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
            .await
            .expect("no change reported")
            .unwrap();
        assert_eq!(event.root, WatchRoot::Source);
        assert_eq!(event.path.file_name(), source.file_name());
    }
}
