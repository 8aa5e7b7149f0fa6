//! Engine assembly.
//!
//! [`Engine`] owns every component and wires them together: the sync
//! coordinator becomes the queue's flush handler, the prefetch scheduler
//! receives asset URLs found by the cache, and the orchestrator watches
//! everything.

use crate::cache::{AssetPrefetcher, TieredCacheManager};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::conflict::{ConflictResolver, ServerWins};
use crate::error::{EngineError, EngineResult};
use crate::local_store::{LocalStore, MemoryLocalStore};
use crate::orchestrator::IntegrationOrchestrator;
use crate::prefetch::{PrefetchFetcher, PrefetchScheduler};
use crate::queue::OfflineWriteQueue;
use crate::realtime::{ChannelTransport, RealtimeChannelManager};
use crate::remote::RemoteBackend;
use crate::sync::SyncCoordinator;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tidepool_storage::{InMemoryStore, KeyValueStore};
use tokio::task::JoinHandle;
use tracing::info;

/// Collects the collaborators of an [`Engine`].
///
/// The remote backend, channel transport and prefetch fetcher are
/// required. Everything else has an in-memory default.
///
/// # Example
///
/// ```rust,ignore
/// let engine = EngineBuilder::new(EngineConfig::default())
///     .remote(Arc::new(MockRemote::new()))
///     .transport(Arc::new(MockChannelTransport::new()))
///     .fetcher(Arc::new(MockFetcher::new()))
///     .store(Arc::new(FileStore::open(path)?))
///     .build()?;
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn KeyValueStore>>,
    local: Option<Arc<dyn LocalStore>>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    remote: Option<Arc<dyn RemoteBackend>>,
    transport: Option<Arc<dyn ChannelTransport>>,
    fetcher: Option<Arc<dyn PrefetchFetcher>>,
}

impl EngineBuilder {
    /// Starts a builder with the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Sets the clock. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the durable key-value store. Defaults to memory.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the local row store. Defaults to memory.
    pub fn local_store(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    /// Sets the conflict resolver. Defaults to [`ServerWins`].
    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Sets the remote backend.
    pub fn remote(mut self, remote: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets the realtime channel transport.
    pub fn transport(mut self, transport: Arc<dyn ChannelTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the prefetch fetcher.
    pub fn fetcher(mut self, fetcher: Arc<dyn PrefetchFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Builds and wires the engine.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if a required collaborator is missing, or a
    /// storage error if persisted state cannot be read.
    pub fn build(self) -> EngineResult<Engine> {
        let remote = self.remote.ok_or_else(|| missing("remote backend"))?;
        let transport = self.transport.ok_or_else(|| missing("channel transport"))?;
        let fetcher = self.fetcher.ok_or_else(|| missing("prefetch fetcher"))?;

        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn KeyValueStore>);
        let local = self
            .local
            .unwrap_or_else(|| Arc::new(MemoryLocalStore::new()) as Arc<dyn LocalStore>);
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(ServerWins) as Arc<dyn ConflictResolver>);

        let cache = Arc::new(TieredCacheManager::new(
            config.cache.clone(),
            Arc::clone(&clock),
            Arc::clone(&store),
        ));
        let queue = Arc::new(OfflineWriteQueue::open(
            config.queue.clone(),
            Arc::clone(&clock),
            Arc::clone(&store),
            Arc::clone(&local),
            Arc::clone(&resolver),
        )?);
        let sync = Arc::new(
            SyncCoordinator::new(
                config.sync.clone(),
                Arc::clone(&clock),
                remote,
                Arc::clone(&local),
                Arc::clone(&store),
                Arc::clone(&queue),
                resolver,
            )?
            .with_cache(Arc::clone(&cache)),
        );
        sync.attach_to_queue();

        let realtime = RealtimeChannelManager::new(
            config.realtime.clone(),
            Arc::clone(&clock),
            transport,
            Some(Arc::clone(&cache)),
        );
        let prefetch = PrefetchScheduler::new(
            config.prefetch.clone(),
            Arc::clone(&clock),
            Arc::clone(&store),
            Arc::clone(&cache),
            fetcher,
        );
        let prefetcher: Weak<dyn AssetPrefetcher> =
            Arc::downgrade(&prefetch) as Weak<dyn AssetPrefetcher>;
        cache.set_asset_prefetcher(prefetcher);

        let orchestrator = IntegrationOrchestrator::new(
            config.orchestrator.clone(),
            clock,
            Arc::clone(&local),
            Arc::clone(&sync),
            Arc::clone(&queue),
            Arc::clone(&realtime),
            Arc::clone(&cache),
            Arc::clone(&prefetch),
        );

        info!(restored = queue.len(), "engine ready");
        Ok(Engine {
            config,
            local,
            queue,
            sync,
            cache,
            realtime,
            prefetch,
            orchestrator,
            periodic: Mutex::new(None),
        })
    }
}

fn missing(what: &str) -> EngineError {
    EngineError::Configuration(format!("engine requires a {what}"))
}

/// The assembled offline-first engine.
pub struct Engine {
    config: EngineConfig,
    local: Arc<dyn LocalStore>,
    queue: Arc<OfflineWriteQueue>,
    sync: Arc<SyncCoordinator>,
    cache: Arc<TieredCacheManager>,
    realtime: Arc<RealtimeChannelManager>,
    prefetch: Arc<PrefetchScheduler>,
    orchestrator: Arc<IntegrationOrchestrator>,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Returns a builder.
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Starts background work for a signed-in user: prefetching and, when
    /// configured, periodic sync. Must be called inside a tokio runtime.
    pub fn start(&self, user_id: &str) {
        let planned = self.prefetch.start_prefetching(user_id);
        if let Some(interval) = self.config.sync.periodic_interval {
            let handle = self.sync.spawn_periodic_sync(user_id, interval);
            if let Some(previous) = self.periodic.lock().replace(handle) {
                previous.abort();
            }
        }
        info!(user_id, planned, "engine started");
    }

    /// Stops background work. Queued mutations stay durable.
    pub fn stop(&self) {
        self.prefetch.stop();
        if let Some(handle) = self.periodic.lock().take() {
            handle.abort();
        }
        info!("engine stopped");
    }

    /// Reports connectivity. Coming online flushes the write queue and
    /// retries disconnected channels.
    pub async fn set_online(&self, online: bool) {
        self.queue.set_online(online);
        if online {
            self.realtime.reconnect_all().await;
        }
    }

    /// Local row store.
    pub fn local_store(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    /// Offline write queue.
    pub fn queue(&self) -> &Arc<OfflineWriteQueue> {
        &self.queue
    }

    /// Sync coordinator.
    pub fn sync(&self) -> &Arc<SyncCoordinator> {
        &self.sync
    }

    /// Tiered cache.
    pub fn cache(&self) -> &Arc<TieredCacheManager> {
        &self.cache
    }

    /// Realtime channel manager.
    pub fn realtime(&self) -> &Arc<RealtimeChannelManager> {
        &self.realtime
    }

    /// Prefetch scheduler.
    pub fn prefetch(&self) -> &Arc<PrefetchScheduler> {
        &self.prefetch
    }

    /// Health aggregation and maintenance.
    pub fn orchestrator(&self) -> &Arc<IntegrationOrchestrator> {
        &self.orchestrator
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(handle) = self.periodic.get_mut().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("queued", &self.queue.len())
            .field("sync", &self.sync.state())
            .finish_non_exhaustive()
    }
}
