//! Key-value store trait definition.

use crate::error::StorageResult;
use std::collections::BTreeMap;

/// One write in an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or replace a value.
    Put {
        /// Key to write.
        key: String,
        /// New value.
        value: String,
    },
    /// Remove a key; missing keys are ignored.
    Delete {
        /// Key to remove.
        key: String,
    },
}

impl WriteOp {
    /// Creates a put.
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        WriteOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Creates a delete.
    pub fn delete(key: impl Into<String>) -> Self {
        WriteOp::Delete { key: key.into() }
    }

    /// Returns the key the operation touches.
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
        }
    }
}

/// Applies a batch to an ordered map.
pub(crate) fn apply_ops(map: &mut BTreeMap<String, String>, ops: Vec<WriteOp>) {
    for op in ops {
        match op {
            WriteOp::Put { key, value } => {
                map.insert(key, value);
            }
            WriteOp::Delete { key } => {
                map.remove(&key);
            }
        }
    }
}

/// Collects entries of an ordered map under a key prefix.
pub(crate) fn scan_map(map: &BTreeMap<String, String>, prefix: &str) -> Vec<(String, String)> {
    map.range(prefix.to_string()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// A durable key-value store.
///
/// # Invariants
///
/// - `get` returns exactly the last value written under a key
/// - `write_batch` applies all of its operations or none of them
/// - `scan_prefix` returns entries in ascending key order
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait KeyValueStore: Send + Sync {
    /// Reads the value under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Writes `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        self.write_batch(vec![WriteOp::put(key, value)])
    }

    /// Removes `key`. Returns true if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete cannot be made durable.
    fn delete(&self, key: &str) -> StorageResult<bool> {
        let existed = self.get(key)?.is_some();
        if existed {
            self.write_batch(vec![WriteOp::delete(key)])?;
        }
        Ok(existed)
    }

    /// Returns every entry whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>>;

    /// Applies a batch of writes atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be made durable; in that case
    /// none of its operations are visible.
    fn write_batch(&self, ops: Vec<WriteOp>) -> StorageResult<()>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        (**self).put(key, value)
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        (**self).delete(key)
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>> {
        (**self).scan_prefix(prefix)
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> StorageResult<()> {
        (**self).write_batch(ops)
    }
}
