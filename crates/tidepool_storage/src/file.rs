//! File-backed key-value store.

use crate::backend::{apply_ops, scan_map, KeyValueStore, WriteOp};
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// A file-backed key-value store.
///
/// All entries live in memory and are persisted as one JSON object. Every
/// write batch rewrites the snapshot to a temporary file, syncs it, and
/// renames it over the data file, so a crash leaves either the old or the
/// new snapshot on disk.
///
/// # Layout
///
/// ```text
/// <path>        # JSON snapshot
/// <path>.tmp    # snapshot being written
/// <path>.lock   # advisory lock for single-writer
/// ```
///
/// # Example
///
/// ```no_run
/// use tidepool_storage::{FileStore, KeyValueStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("tidepool.json")).unwrap();
/// store.put("cursor", "42").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    data: RwLock<BTreeMap<String, String>>,
    /// Lock file handle (held for exclusive access).
    _lock_file: File,
}

impl FileStore {
    /// Opens or creates a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process holds the lock (returns `Locked`)
    /// - The existing snapshot cannot be parsed (returns `Corrupted`)
    /// - I/O errors occur
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(sibling(path, "lock"))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        let data = match fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                StorageError::Corrupted(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            data: RwLock::new(data),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of stored entries.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn persist(&self, data: &BTreeMap<String, String>) -> StorageResult<()> {
        let temp = sibling(&self.path, "tmp");
        let encoded = serde_json::to_vec(data)?;
        {
            let mut file = File::create(&temp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>> {
        Ok(scan_map(&self.data.read(), prefix))
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> StorageResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut data = self.data.write();
        let mut next = data.clone();
        apply_ops(&mut next, ops);
        self.persist(&next)?;
        *data = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = FileStore::open(&path).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.path(), path.as_path());
    }

    #[test]
    fn file_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.put("queue:1", "{\"id\":1}").unwrap();
            store.put("cursor", "7").unwrap();
            store.delete("cursor").unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("queue:1").unwrap().as_deref(),
            Some("{\"id\":1}")
        );
        assert!(!sibling(&path, "tmp").exists());
    }

    #[test]
    fn file_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let first = FileStore::open(&path).unwrap();
        assert!(matches!(FileStore::open(&path), Err(StorageError::Locked)));
        drop(first);
        assert!(FileStore::open(&path).is_ok());
    }

    #[test]
    fn file_corrupted_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "not json").unwrap();

        assert!(matches!(
            FileStore::open(&path),
            Err(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn file_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("store.json");
        let store = FileStore::open(&path).unwrap();
        store.put("a", "1").unwrap();
        assert!(path.exists());
    }
}
