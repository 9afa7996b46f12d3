//! Durable storage backends.

use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, SyncError};

/// A key-value byte store that snapshots are written to.
pub trait PersistenceBackend: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Volatile in-process backend.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `set` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl PersistenceBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One file per key inside a directory held under an exclusive lock.
pub struct FileBackend {
    dir: PathBuf,
    /// Held for the backend's lifetime.
    _lock: File,
}

impl FileBackend {
    /// Open (creating if needed) a directory-backed store.
    ///
    /// Fails with [`SyncError::Locked`] if another process holds the directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock = Self::acquire_lock(&dir)?;
        Ok(Self { dir, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let lock_file = File::create(dir.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| SyncError::Locked)?;
        Ok(lock_file)
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.snap", safe))
    }
}

impl PersistenceBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.key_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.key_path(key);
        let tmp = path.with_extension("snap.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        // Atomic replace
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_backend() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("k").unwrap(), None);
        backend.set("k", b"abc").unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(b"abc".to_vec()));
        assert_eq!(backend.write_count(), 1);
    }

    #[test]
    fn test_file_backend_roundtrip() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();

        backend.set("app/state:v1", b"one").unwrap();
        backend.set("app/state:v1", b"two").unwrap();
        assert_eq!(backend.get("app/state:v1").unwrap(), Some(b"two".to_vec()));
        assert_eq!(backend.get("missing").unwrap(), None);
    }

    #[test]
    fn test_file_backend_lock() {
        let dir = TempDir::new().unwrap();
        let _first = FileBackend::open(dir.path()).unwrap();
        assert!(matches!(FileBackend::open(dir.path()), Err(SyncError::Locked)));
    }
}
