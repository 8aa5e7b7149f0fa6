//! Test fixtures and engine helpers.
//!
//! Provides row builders for every synced table and a [`TestEngine`] wired
//! to a [`ReferenceBackend`], a manual clock and mock transports.

use crate::backend::ReferenceBackend;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tidepool_engine::prefetch::{MockFetcher, PrefetchFetcher};
use tidepool_engine::{
    ChannelTransport, Clock, Engine, EngineConfig, LocalStore, ManualClock, MemoryLocalStore,
    MockChannelTransport, RemoteBackend,
};
use tidepool_storage::{FileStore, InMemoryStore, KeyValueStore};

/// Fixed timestamp used by the row builders.
pub const FIXTURE_TIME: &str = "2026-01-01T00:00:00.000Z";

/// Builds a profile row.
pub fn profile(id: &str, display_name: &str) -> Value {
    json!({
        "id": id,
        "display_name": display_name,
        "updated_at": FIXTURE_TIME,
    })
}

/// Builds a conversation row.
pub fn conversation(id: &str, title: &str, created_by: &str) -> Value {
    json!({
        "id": id,
        "title": title,
        "created_by": created_by,
        "created_at": FIXTURE_TIME,
        "updated_at": FIXTURE_TIME,
    })
}

/// Builds a message row.
pub fn message(id: &str, conversation_id: &str, sender_id: &str, content: &str) -> Value {
    json!({
        "id": id,
        "conversation_id": conversation_id,
        "sender_id": sender_id,
        "content": content,
        "created_at": FIXTURE_TIME,
        "updated_at": FIXTURE_TIME,
    })
}

/// Builds a task row.
pub fn task(id: &str, owner_id: &str, title: &str) -> Value {
    json!({
        "id": id,
        "owner_id": owner_id,
        "title": title,
        "status": "open",
        "created_at": FIXTURE_TIME,
        "updated_at": FIXTURE_TIME,
    })
}

/// An engine wired to test collaborators.
///
/// The durable store and local store outlive the engine so a test can
/// simulate a restart with [`TestEngine::restart`].
pub struct TestEngine {
    /// The engine under test.
    pub engine: Engine,
    /// Clock shared by every component.
    pub clock: Arc<ManualClock>,
    /// Server side.
    pub backend: Arc<ReferenceBackend>,
    /// Realtime transport.
    pub transport: Arc<MockChannelTransport>,
    /// Prefetch fetcher.
    pub fetcher: Arc<MockFetcher>,
    /// Durable key-value store.
    pub store: Arc<dyn KeyValueStore>,
    /// Local row store.
    pub local: Arc<dyn LocalStore>,
    config: EngineConfig,
    _temp_dir: Option<TempDir>,
}

impl TestEngine {
    /// Creates an engine over in-memory stores with the default config.
    pub fn memory() -> Self {
        Self::memory_with(EngineConfig::default())
    }

    /// Creates an engine over in-memory stores.
    pub fn memory_with(config: EngineConfig) -> Self {
        Self::assemble(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(ReferenceBackend::new()),
            Arc::new(ManualClock::default()),
            Arc::new(MemoryLocalStore::new()),
            None,
        )
    }

    /// Creates an engine over a file-backed store in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = FileStore::open(&temp_dir.path().join("tidepool.json"))
            .expect("Failed to open file store");
        Self::assemble(
            EngineConfig::default(),
            Arc::new(store),
            Arc::new(ReferenceBackend::new()),
            Arc::new(ManualClock::default()),
            Arc::new(MemoryLocalStore::new()),
            Some(temp_dir),
        )
    }

    /// Drops the engine and builds a new one over the same stores, backend
    /// and clock.
    pub fn restart(self) -> Self {
        let Self {
            engine,
            clock,
            backend,
            store,
            local,
            config,
            _temp_dir,
            ..
        } = self;
        drop(engine);
        Self::assemble(config, store, backend, clock, local, _temp_dir)
    }

    /// Returns the store path if file-backed.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir
            .as_ref()
            .map(|d| d.path().join("tidepool.json"))
    }

    fn assemble(
        config: EngineConfig,
        store: Arc<dyn KeyValueStore>,
        backend: Arc<ReferenceBackend>,
        clock: Arc<ManualClock>,
        local: Arc<dyn LocalStore>,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let transport = Arc::new(MockChannelTransport::new());
        let fetcher = Arc::new(MockFetcher::new());
        let engine = Engine::builder(config.clone())
            .clock(Arc::clone(&clock) as Arc<dyn Clock>)
            .store(Arc::clone(&store))
            .local_store(Arc::clone(&local))
            .remote(Arc::clone(&backend) as Arc<dyn RemoteBackend>)
            .transport(Arc::clone(&transport) as Arc<dyn ChannelTransport>)
            .fetcher(Arc::clone(&fetcher) as Arc<dyn PrefetchFetcher>)
            .build()
            .expect("Failed to build engine");
        Self {
            engine,
            clock,
            backend,
            transport,
            fetcher,
            store,
            local,
            config,
            _temp_dir: temp_dir,
        }
    }
}

impl std::ops::Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Runs a test body against a fresh in-memory [`TestEngine`].
///
/// Must be called inside a tokio runtime.
pub async fn with_test_engine<F, Fut>(f: F)
where
    F: FnOnce(TestEngine) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    f(TestEngine::memory()).await;
}
