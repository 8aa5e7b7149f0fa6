//! # Tidepool Engine
//!
//! Offline-first sync, caching and realtime-channel engine for the Tidepool
//! mobile client.
//!
//! This crate provides:
//! - [`OfflineWriteQueue`]: durable, prioritized local writes with debounced
//!   flushing and exponential retry
//! - [`SyncCoordinator`]: pull-then-push against the remote backend behind a
//!   single-flight lock, with throttling and turbo first sync
//! - [`ConflictResolver`]: the server-wins policy for pulled rows
//! - [`TieredCacheManager`]: memory and durable tiers with per-domain TTL,
//!   deduplication, compression and time grouping
//! - [`RealtimeChannelManager`]: pooled channels with rate limiting,
//!   batching, reconnect backoff and offline outboxes
//! - [`PrefetchScheduler`]: behavior-driven speculative fetches
//! - [`IntegrationOrchestrator`]: aggregate health and maintenance
//!
//! ## Architecture
//!
//! Local writes go to the queue, which flushes through the sync
//! coordinator. Pulled changes pass the conflict resolver, land in the
//! local store and invalidate the cache. Realtime events invalidate the
//! cache and notify subscribers. Every component publishes its status on an
//! [`Observable`], which is the engine's only outward surface.
//!
//! ## Key Invariants
//!
//! - At most one sync pass runs at a time
//! - Every queued mutation ends `Synced` or `Failed`
//! - Pull always happens before push
//! - The remote copy wins a conflict
//! - Bounded queues evict by policy instead of growing

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
mod clock;
mod config;
mod conflict;
mod engine;
mod error;
mod local_store;
mod observable;
mod orchestrator;
pub mod prefetch;
pub mod queue;
pub mod realtime;
mod remote;
pub mod sync;
mod timer;

pub use cache::{
    CacheCleanupReport, CacheInvalidation, CacheStats, CacheWrite, InvalidationReason,
    TieredCacheManager,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CacheConfig, CacheDomain, EngineConfig, OrchestratorConfig, PrefetchConfig, QueueConfig,
    RealtimeConfig, RetryConfig, SyncConfig,
};
pub use conflict::{ConflictResolver, Resolution, ServerWins};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use local_store::{LocalRow, LocalStore, LocalWrite, MemoryLocalStore, RowStatus};
pub use observable::{EventFeed, Observable, Subscription};
pub use orchestrator::{
    cache_health, prefetch_health, queue_health, realtime_health, sync_health, Component,
    ComponentHealth, ComponentReport, ConsistencyReport, Diagnostics, ForceSyncReport,
    HealthReport, IntegrationOrchestrator, OptimizationReport,
};
pub use prefetch::PrefetchScheduler;
pub use queue::{CleanupReport, OfflineWriteQueue, QueueStatus};
pub use realtime::{ChannelTransport, MockChannelTransport, RealtimeChannelManager};
pub use remote::{MockRemote, RemoteBackend};
pub use sync::{SyncCoordinator, SyncOptions, SyncState, SyncStats, SyncStatus};
pub use timer::{ScheduledTask, TaskState};
