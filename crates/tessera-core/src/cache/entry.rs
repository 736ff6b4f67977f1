//! On-disk cache entry format.
//!
//! ```text
//! magic "TSC1" | created_ms u64 LE | expires_ms u64 LE (0 = never) | value
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::fingerprint::Fingerprint;

const MAGIC: &[u8; 4] = b"TSC1";
const HEADER_LEN: usize = 4 + 8 + 8;

/// A cached value with its timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: Fingerprint,
    pub value: Vec<u8>,
    pub created_at: SystemTime,
    /// `None` means the entry never expires.
    pub expires_at: Option<SystemTime>,
}

impl CacheEntry {
    pub fn new(key: Fingerprint, value: Vec<u8>, ttl: Option<Duration>) -> Self {
        let created_at = SystemTime::now();
        Self {
            key,
            value,
            created_at,
            expires_at: ttl.map(|ttl| created_at + ttl),
        }
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        is_expired(self.expires_at, now)
    }

    /// Bytes this entry occupies on disk.
    pub fn disk_size(&self) -> u64 {
        (HEADER_LEN + self.value.len()) as u64
    }
}

pub(crate) fn is_expired(expires_at: Option<SystemTime>, now: SystemTime) -> bool {
    expires_at.is_some_and(|at| at <= now)
}

/// Header fields read without loading the value.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryHeader {
    pub created_at: SystemTime,
    pub expires_at: Option<SystemTime>,
}

fn to_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn from_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

fn encode_header(entry: &CacheEntry) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(MAGIC);
    header[4..12].copy_from_slice(&to_millis(entry.created_at).to_le_bytes());
    // A zero expiry is reserved for "never", so clamp real expiries to >= 1ms.
    let expires = entry.expires_at.map(|t| to_millis(t).max(1)).unwrap_or(0);
    header[12..20].copy_from_slice(&expires.to_le_bytes());
    header
}

fn decode_header(bytes: &[u8]) -> io::Result<EntryHeader> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "not a cache entry",
        ));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[4..12]);
    let created = u64::from_le_bytes(word);
    word.copy_from_slice(&bytes[12..20]);
    let expires = u64::from_le_bytes(word);
    Ok(EntryHeader {
        created_at: from_millis(created),
        expires_at: (expires != 0).then(|| from_millis(expires)),
    })
}

/// Write an entry atomically: temp file, then rename.
pub(crate) fn write(path: &Path, entry: &CacheEntry) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&encode_header(entry))?;
        file.write_all(&entry.value)?;
        file.sync_data()?;
    }
    fs::rename(&temp_path, path)
}

pub(crate) fn read(path: &Path, key: Fingerprint) -> io::Result<CacheEntry> {
    let bytes = fs::read(path)?;
    let header = decode_header(&bytes)?;
    Ok(CacheEntry {
        key,
        value: bytes[HEADER_LEN..].to_vec(),
        created_at: header.created_at,
        expires_at: header.expires_at,
    })
}

/// Read only the header and total size of an entry file.
pub(crate) fn read_header(path: &Path) -> io::Result<(EntryHeader, u64)> {
    use std::io::Read;

    let mut file = fs::File::open(path)?;
    let size = file.metadata()?.len();
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header)?;
    Ok((decode_header(&header)?, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key() -> Fingerprint {
        Fingerprint::from_bytes([7u8; 32])
    }

    #[test]
    fn test_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00").join("entry.entry");
        let entry = CacheEntry::new(key(), b"tile bytes".to_vec(), Some(Duration::from_secs(60)));

        write(&path, &entry).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded = read(&path, key()).unwrap();
        assert_eq!(loaded.value, b"tile bytes");
        assert!(!loaded.is_expired_at(SystemTime::now()));
        assert!(loaded.expires_at.is_some());

        let (header, size) = read_header(&path).unwrap();
        assert_eq!(size, entry.disk_size());
        assert_eq!(header.expires_at, loaded.expires_at);
    }

    #[test]
    fn test_no_expiry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("forever.entry");
        let entry = CacheEntry::new(key(), vec![], None);
        write(&path, &entry).unwrap();

        let loaded = read(&path, key()).unwrap();
        assert_eq!(loaded.expires_at, None);
        assert!(!loaded.is_expired_at(SystemTime::now() + Duration::from_secs(1 << 30)));
    }

    #[test]
    fn test_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.entry");
        fs::write(&path, b"definitely not an entry file").unwrap();
        let err = read(&path, key()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
