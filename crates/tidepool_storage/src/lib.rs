//! # Tidepool Storage
//!
//! Durable key-value store used by the Tidepool engine for the write
//! queue, persisted cache domains, sync cursors and behavior profiles.
//!
//! Stores are **opaque string stores**: keys are namespaced by the caller
//! (`queue:`, `cache:`, `archive:`, ...) and values are usually JSON, but
//! the store never interprets them.
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing, with failure injection
//! - [`FileStore`] - A JSON snapshot file with atomic replace and an
//!   exclusive lock file
//!
//! ## Example
//!
//! ```rust
//! use tidepool_storage::{InMemoryStore, KeyValueStore};
//!
//! let store = InMemoryStore::new();
//! store.put("queue:1", "{}").unwrap();
//! assert_eq!(store.get("queue:1").unwrap().as_deref(), Some("{}"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{KeyValueStore, WriteOp};
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
