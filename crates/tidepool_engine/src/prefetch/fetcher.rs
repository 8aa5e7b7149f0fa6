//! Prefetch fetch abstraction.

use super::task::PrefetchTarget;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};

/// Loads the data behind a prefetch target.
#[async_trait]
pub trait PrefetchFetcher: Send + Sync {
    /// Fetches `target`. The result is cached by the scheduler.
    async fn fetch(&self, target: &PrefetchTarget) -> EngineResult<Value>;
}

/// A fetcher for testing.
#[derive(Debug, Default)]
pub struct MockFetcher {
    failures: AtomicU32,
    fetched: Mutex<Vec<PrefetchTarget>>,
}

impl MockFetcher {
    /// Creates a fetcher that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` fetches fail.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Returns every target fetched so far, including failed attempts.
    pub fn fetched(&self) -> Vec<PrefetchTarget> {
        self.fetched.lock().clone()
    }
}

#[async_trait]
impl PrefetchFetcher for MockFetcher {
    async fn fetch(&self, target: &PrefetchTarget) -> EngineResult<Value> {
        self.fetched.lock().push(target.clone());
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EngineError::transport_retryable("simulated fetch failure"));
        }
        let (domain, key) = target.cache_slot();
        Ok(json!({ "domain": domain, "key": key, "prefetched": true }))
    }
}
