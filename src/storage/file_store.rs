//! Byte-addressable backing stores for the disk tier.
//!
//! A [`StorageManager`] hands out named [`FileStore`]s. Two managers ship:
//! - [`FileStorageManager`] - one file per store inside a directory
//! - [`MemoryStorageManager`] - heap-backed stores, for tests and diskless setups

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::common::Result;

/// A growable, randomly addressable byte store.
///
/// # Thread Safety
/// Implementations must tolerate concurrent calls. Callers coordinate
/// overlapping ranges themselves.
pub trait FileStore: Send + Sync {
    fn name(&self) -> &str;

    /// Read up to `buf.len()` bytes at `offset`. Returns 0 at end of store.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data` at `offset`, growing the store as needed.
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    fn len(&self) -> io::Result<u64>;

    fn set_len(&self, len: u64) -> io::Result<()>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Fill `buf` from `offset`, failing with `UnexpectedEof` if the store
    /// ends first.
    fn read_exact_at(&self, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(offset, buf)? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => {
                    offset += n as u64;
                    buf = &mut buf[n..];
                }
            }
        }
        Ok(())
    }
}

/// Sequential reader over a range of a [`FileStore`].
pub struct FileStoreReader<'a> {
    store: &'a dyn FileStore,
    offset: u64,
    remaining: u64,
}

impl<'a> FileStoreReader<'a> {
    pub fn new(store: &'a dyn FileStore, offset: u64, len: u64) -> Self {
        Self {
            store,
            offset,
            remaining: len,
        }
    }
}

impl Read for FileStoreReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(self.remaining as usize);
        let n = self.store.read_at(self.offset, &mut buf[..len])?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.offset += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Creates the stores backing the disk tier.
pub trait StorageManager: Send + Sync {
    fn create_file_store(&self, name: &str) -> Result<Arc<dyn FileStore>>;
}

// ============================================================================
// File-backed stores
// ============================================================================

/// Stores backed by files in one directory.
///
/// Store files are deleted when the store is dropped. A directory the
/// manager created itself is removed when the manager is dropped.
pub struct FileStorageManager {
    directory: PathBuf,
    _temporary: Option<TempDir>,
}

impl FileStorageManager {
    /// Use (and create if needed) `directory`.
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<Self> {
        fs::create_dir_all(directory.as_ref())?;
        Ok(Self {
            directory: directory.as_ref().to_path_buf(),
            _temporary: None,
        })
    }

    /// Use a fresh directory under the system temp directory.
    pub fn temporary() -> Result<Self> {
        let temporary = tempfile::Builder::new().prefix("spillcache-").tempdir()?;
        let directory = temporary.path().to_path_buf();
        debug!(directory = %directory.display(), "created storage directory");
        Ok(Self {
            directory,
            _temporary: Some(temporary),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl StorageManager for FileStorageManager {
    fn create_file_store(&self, name: &str) -> Result<Arc<dyn FileStore>> {
        let path = self.directory.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Arc::new(DiskFileStore {
            name: name.to_string(),
            path,
            file,
        }))
    }
}

/// One file of a [`FileStorageManager`].
///
/// Reads and writes are positional, so concurrent readers never contend on
/// a shared cursor.
struct DiskFileStore {
    name: String,
    path: PathBuf,
    file: File,
}

impl FileStore for DiskFileStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        positional::read_at(&self.file, buf, offset)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        positional::write_all_at(&self.file, data, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }
}

impl Drop for DiskFileStore {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "could not remove storage file");
            }
        }
    }
}

#[cfg(unix)]
mod positional {
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt;

    pub(super) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        file.read_at(buf, offset)
    }

    pub(super) fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
        file.write_all_at(data, offset)
    }
}

#[cfg(windows)]
mod positional {
    use std::fs::File;
    use std::io;
    use std::os::windows::fs::FileExt;

    pub(super) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        file.seek_read(buf, offset)
    }

    pub(super) fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
        while !data.is_empty() {
            match file.seek_write(data, offset)? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => {
                    data = &data[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Heap-backed stores
// ============================================================================

/// Stores kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStorageManager;

impl MemoryStorageManager {
    pub fn new() -> Self {
        Self
    }
}

impl StorageManager for MemoryStorageManager {
    fn create_file_store(&self, name: &str) -> Result<Arc<dyn FileStore>> {
        Ok(Arc::new(MemoryFileStore {
            name: name.to_string(),
            data: RwLock::new(Vec::new()),
        }))
    }
}

struct MemoryFileStore {
    name: String,
    data: RwLock<Vec<u8>>,
}

impl FileStore for MemoryFileStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.read();
        let start = (offset as usize).min(data.len());
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.data.write().resize(len as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(store: &dyn FileStore) {
        assert!(store.is_empty().unwrap());
        store.write_at(10, b"hello").unwrap();
        assert_eq!(store.len().unwrap(), 15);

        let mut buf = [0u8; 5];
        store.read_exact_at(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        let mut out = Vec::new();
        FileStoreReader::new(store, 12, 3).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"llo");

        store.set_len(11).unwrap();
        assert_eq!(store.len().unwrap(), 11);
        let err = store.read_exact_at(10, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_memory_store() {
        let manager = MemoryStorageManager::new();
        let store = manager.create_file_store("mem").unwrap();
        assert_eq!(store.name(), "mem");
        exercise(store.as_ref());
    }

    #[test]
    fn test_disk_store() {
        let dir = tempdir().unwrap();
        let manager = FileStorageManager::new(dir.path()).unwrap();
        let store = manager.create_file_store("segment-0").unwrap();
        exercise(store.as_ref());
    }

    #[test]
    fn test_disk_store_removed_on_drop() {
        let dir = tempdir().unwrap();
        let manager = FileStorageManager::new(dir.path()).unwrap();
        let store = manager.create_file_store("gone").unwrap();
        store.write_at(0, b"x").unwrap();
        assert!(dir.path().join("gone").exists());

        drop(store);
        assert!(!dir.path().join("gone").exists());
    }

    #[test]
    fn test_concurrent_positional_reads() {
        let dir = tempdir().unwrap();
        let manager = FileStorageManager::new(dir.path()).unwrap();
        let store = manager.create_file_store("shared").unwrap();
        let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        store.write_at(0, &data).unwrap();

        std::thread::scope(|scope| {
            for t in 0..4usize {
                let store = &store;
                let data = &data;
                scope.spawn(move || {
                    for i in 0..64 {
                        let offset = ((t * 64 + i) * 997) % (data.len() - 512);
                        let mut buf = [0u8; 512];
                        store.read_exact_at(offset as u64, &mut buf).unwrap();
                        assert_eq!(&buf[..], &data[offset..offset + 512]);
                    }
                });
            }
        });
    }

    #[test]
    fn test_temporary_directory_cleanup() {
        let manager = FileStorageManager::temporary().unwrap();
        let directory = manager.directory().to_path_buf();
        assert!(directory.exists());

        drop(manager);
        assert!(!directory.exists());
    }
}
