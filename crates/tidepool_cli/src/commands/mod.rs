//! CLI command implementations.

pub mod archive;
pub mod cache;
pub mod queue;
pub mod retry;

use std::path::Path;
use std::sync::Arc;
use tidepool_engine::{
    MemoryLocalStore, OfflineWriteQueue, QueueConfig, ServerWins, SystemClock,
};
use tidepool_storage::{FileStore, KeyValueStore};

/// Opens the store file at `path`.
///
/// Fails if the file is missing or held by a running client.
pub fn open_store(path: &Path) -> Result<Arc<dyn KeyValueStore>, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No store found at {:?}", path).into());
    }
    Ok(Arc::new(FileStore::open(path)?))
}

/// Opens the write queue over `store` without connecting it to a backend.
pub fn open_queue(
    store: Arc<dyn KeyValueStore>,
    config: QueueConfig,
) -> Result<OfflineWriteQueue, Box<dyn std::error::Error>> {
    let queue = OfflineWriteQueue::open(
        config,
        Arc::new(SystemClock),
        store,
        Arc::new(MemoryLocalStore::new()),
        Arc::new(ServerWins),
    )?;
    queue.set_online(false);
    Ok(queue)
}
