//! Project directory management.
//!
//! Provides consistent directory structure for a Tessera project, ensuring
//! the pool, cache and watcher agree on where things live.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Directory structure for a Tessera project.
///
/// All Tessera-managed files are stored under a `.tessera` directory next to
/// the watched source:
///
/// ```text
/// tiles.py
/// .tessera/
/// └── cache/      # Fingerprint-addressed cache entries
///     ├── .gitignore
///     ├── 00/
///     └── 01/ ...
/// ```
#[derive(Debug, Clone)]
pub struct ProjectDirs {
    /// The `.tessera` directory itself.
    pub tessera_dir: PathBuf,

    /// Cache directory for computed results.
    pub cache_dir: PathBuf,
}

impl ProjectDirs {
    /// Directory layout for the project owning `source_path`.
    ///
    /// Does not touch the filesystem; see [`ProjectDirs::create`].
    pub fn for_source(source_path: &Path) -> Self {
        let source_dir = if source_path.is_dir() {
            source_path
        } else {
            source_path.parent().unwrap_or(Path::new("."))
        };
        Self::for_source_dir(source_dir)
    }

    pub fn for_source_dir(source_dir: &Path) -> Self {
        let tessera_dir = source_dir.join(".tessera");
        let cache_dir = tessera_dir.join("cache");
        Self {
            tessera_dir,
            cache_dir,
        }
    }

    /// Create the layout for `source_path`, including all directories.
    ///
    /// # Errors
    /// Returns an error if directory creation fails.
    pub fn from_source_path(source_path: &Path) -> Result<Self> {
        let dirs = Self::for_source(source_path);
        dirs.create()?;
        Ok(dirs)
    }

    /// Create the layout inside `source_dir`.
    pub fn from_source_dir(source_dir: &Path) -> Result<Self> {
        let dirs = Self::for_source_dir(source_dir);
        dirs.create()?;
        Ok(dirs)
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)?;
        write_gitignore_marker(&self.cache_dir)?;
        Ok(())
    }

    /// Remove the whole `.tessera` directory and recreate it.
    pub fn clean(&self) -> Result<()> {
        if self.tessera_dir.exists() {
            fs::remove_dir_all(&self.tessera_dir)?;
        }
        self.create()
    }
}

/// Write a `.gitignore` containing `*` into `dir`, unless one already exists.
///
/// Returns `true` if the marker was created by this call.
pub fn write_gitignore_marker(dir: &Path) -> Result<bool> {
    fs::create_dir_all(dir)?;
    let path = dir.join(".gitignore");
    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            file.write_all(b"*\n")?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_source_path() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let source = temp.path().join("tiles.py");

        let dirs = ProjectDirs::from_source_path(&source).expect("Failed to create dirs");

        assert!(dirs.tessera_dir.ends_with(".tessera"));
        assert!(dirs.cache_dir.exists());
        assert!(dirs.cache_dir.join(".gitignore").exists());
    }

    #[test]
    fn test_gitignore_marker_is_written_once() {
        let temp = TempDir::new().unwrap();
        assert!(write_gitignore_marker(temp.path()).unwrap());

        fs::write(temp.path().join(".gitignore"), "custom").unwrap();
        assert!(!write_gitignore_marker(temp.path()).unwrap());
        assert_eq!(
            fs::read_to_string(temp.path().join(".gitignore")).unwrap(),
            "custom"
        );
    }

    #[test]
    fn test_clean() {
        let temp = TempDir::new().unwrap();
        let dirs = ProjectDirs::from_source_dir(temp.path()).unwrap();

        let stale = dirs.cache_dir.join("stale.entry");
        fs::write(&stale, "x").unwrap();

        dirs.clean().unwrap();
        assert!(!stale.exists());
        assert!(dirs.cache_dir.exists());
    }
}
