//! Configuration for the engine.
//!
//! Every component takes its own config struct; [`EngineConfig`] bundles
//! them for the [`EngineBuilder`](crate::EngineBuilder).

use rand::Rng;
use std::time::Duration;
use tidepool_protocol::Table;

/// Configuration for retry behavior.
///
/// Delays grow as `initial_delay * multiplier^(attempt - 1)`, plus up to
/// `max_jitter` of random jitter, and never exceed `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Upper bound of the random jitter added to each delay.
    pub max_jitter: Duration,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_jitter: Duration::ZERO,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_jitter: Duration::ZERO,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the jitter bound.
    pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }

    /// Returns true if another attempt is allowed after `attempts` tries.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Calculates the delay for a given attempt (1-indexed; 0 is immediate).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_for_attempt_with(attempt, &mut rand::thread_rng())
    }

    /// Calculates the delay for a given attempt using the supplied RNG.
    pub fn delay_for_attempt_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        let mut delay = base.min(max);

        let jitter = self.max_jitter.as_secs_f64();
        if jitter > 0.0 {
            delay += rng.gen_range(0.0..=jitter);
        }

        Duration::from_secs_f64(delay.min(max).max(0.0))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Configuration for the sync coordinator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Minimum time between two passes unless forced.
    pub min_interval: Duration,
    /// Hard timeout after which a hung pass is abandoned.
    pub lock_timeout: Duration,
    /// Delay before the single push retry.
    pub push_retry_delay: Duration,
    /// Tables every change set must carry.
    pub tables: Vec<Table>,
    /// Interval for the periodic sync loop.
    pub periodic_interval: Option<Duration>,
    /// Consecutive failures after which the status reports an error.
    pub failure_alert_threshold: u32,
}

impl SyncConfig {
    /// Sets the minimum interval.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Sets the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the push retry delay.
    pub fn with_push_retry_delay(mut self, delay: Duration) -> Self {
        self.push_retry_delay = delay;
        self
    }

    /// Sets the periodic sync interval.
    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = Some(interval);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(30),
            push_retry_delay: Duration::from_secs(2),
            tables: Table::ALL.to_vec(),
            periodic_interval: None,
            failure_alert_threshold: 3,
        }
    }
}

/// Configuration for the offline write queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Debounce delay before a flush.
    pub debounce: Duration,
    /// Mutations per push batch.
    pub batch_size: usize,
    /// Batches pushed concurrently.
    pub concurrency: usize,
    /// Backoff for failed mutations.
    pub retry: RetryConfig,
    /// Age after which synced mutations are archived.
    pub retention: Duration,
    /// Mutations archived per cleanup batch.
    pub cleanup_batch: usize,
}

impl QueueConfig {
    /// Sets the debounce delay.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the batch concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the retention window.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            batch_size: 10,
            concurrency: 3,
            retry: RetryConfig::new(5).with_max_delay(Duration::from_secs(300)),
            retention: Duration::from_secs(7 * 24 * 3600),
            cleanup_batch: 100,
        }
    }
}

/// Configuration for realtime channels.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Reconnect backoff; `max_attempts` is the number of consecutive
    /// failures before a channel goes offline.
    pub retry: RetryConfig,
    /// Messages per second allowed per topic.
    pub rate_limit_per_sec: u32,
    /// Messages per combined batch.
    pub batch_size: usize,
    /// Maximum time a message waits in the batch buffer.
    pub batch_timeout: Duration,
    /// Capacity of each topic's offline send queue.
    pub queue_cap: usize,
    /// Maximum open channels.
    pub pool_cap: usize,
    /// Probe interval while offline.
    pub heartbeat_interval: Duration,
}

impl RealtimeConfig {
    /// Sets the per-topic rate limit.
    pub fn with_rate_limit(mut self, per_sec: u32) -> Self {
        self.rate_limit_per_sec = per_sec;
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the per-topic queue cap.
    pub fn with_queue_cap(mut self, cap: usize) -> Self {
        self.queue_cap = cap.max(1);
        self
    }

    /// Sets the pool cap.
    pub fn with_pool_cap(mut self, cap: usize) -> Self {
        self.pool_cap = cap.max(1);
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::new(3).with_max_jitter(Duration::from_secs(1)),
            rate_limit_per_sec: 10,
            batch_size: 10,
            batch_timeout: Duration::from_millis(100),
            queue_cap: 100,
            pool_cap: 10,
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Storage policy of one cache domain.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheDomain {
    /// Domain name.
    pub name: String,
    /// Whether entries are written to the durable store.
    pub persisted: bool,
    /// Whether collections are deduplicated.
    pub dedup: bool,
    /// Time window for grouped summaries.
    pub group_window: Option<Duration>,
    /// TTL when the caller gives none.
    pub default_ttl: Duration,
}

impl CacheDomain {
    /// Creates an in-memory domain.
    pub fn memory(name: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            name: name.into(),
            persisted: false,
            dedup: false,
            group_window: None,
            default_ttl,
        }
    }

    /// Creates a persisted domain.
    pub fn persisted(name: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            persisted: true,
            ..Self::memory(name, default_ttl)
        }
    }

    /// Enables collection dedup.
    pub fn with_dedup(mut self) -> Self {
        self.dedup = true;
        self
    }

    /// Enables time-window grouping.
    pub fn with_group_window(mut self, window: Duration) -> Self {
        self.group_window = Some(window);
        self
    }
}

/// Configuration for the tiered cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Serialized length above which payloads are compressed.
    pub compression_threshold: usize,
    /// TTL for domains not listed in `domains`.
    pub default_ttl: Duration,
    /// Age after which persisted entries are purged.
    pub retention: Duration,
    /// Known domains.
    pub domains: Vec<CacheDomain>,
}

impl CacheConfig {
    /// Adds or replaces a domain.
    pub fn with_domain(mut self, domain: CacheDomain) -> Self {
        self.domains.retain(|d| d.name != domain.name);
        self.domains.push(domain);
        self
    }

    /// Sets the compression threshold.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Looks up a domain policy.
    pub fn domain(&self, name: &str) -> Option<&CacheDomain> {
        self.domains.iter().find(|d| d.name == name)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        let hour = Duration::from_secs(3600);
        Self {
            compression_threshold: 1024,
            default_ttl: Duration::from_secs(300),
            retention: Duration::from_secs(7 * 24 * 3600),
            domains: vec![
                CacheDomain::persisted("profiles", 24 * hour),
                CacheDomain::persisted("conversations", hour).with_dedup(),
                CacheDomain::persisted("messages", hour)
                    .with_dedup()
                    .with_group_window(Duration::from_secs(300)),
                CacheDomain::persisted("tasks", hour).with_dedup(),
                CacheDomain::persisted("assets", 24 * hour),
                CacheDomain::memory("topics", Duration::from_secs(600)),
                CacheDomain::memory("search", Duration::from_secs(300)),
            ],
        }
    }
}

/// Configuration for the prefetch scheduler.
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Pause between two executed tasks.
    pub inter_task_delay: Duration,
    /// Times a failed task is re-enqueued before it is dropped.
    pub max_attempts: u32,
    /// Maximum queued tasks.
    pub queue_cap: usize,
    /// Time after creation at which a task expires.
    pub task_lifetime: Duration,
    /// Entities planned by the frequent-item strategy.
    pub frequent_items: usize,
    /// Topics planned by the topic-affinity strategy.
    pub topics: usize,
    /// Search terms planned by the search-prediction strategy.
    pub search_terms: usize,
    /// Maximum asset URLs waiting for an unmetered network.
    pub asset_backlog_cap: usize,
    /// Battery level below which only notification prefetch runs.
    pub min_battery_pct: u8,
    /// Free storage below which assets are not prefetched.
    pub min_storage_mb: u64,
    /// TTL of prefetched cache entries.
    pub cache_ttl: Duration,
}

impl PrefetchConfig {
    /// Sets the inter-task delay.
    pub fn with_inter_task_delay(mut self, delay: Duration) -> Self {
        self.inter_task_delay = delay;
        self
    }

    /// Sets the queue cap.
    pub fn with_queue_cap(mut self, cap: usize) -> Self {
        self.queue_cap = cap.max(1);
        self
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            inter_task_delay: Duration::from_millis(100),
            max_attempts: 3,
            queue_cap: 200,
            task_lifetime: Duration::from_secs(30 * 60),
            frequent_items: 5,
            topics: 3,
            search_terms: 3,
            asset_backlog_cap: 100,
            min_battery_pct: 20,
            min_storage_mb: 100,
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// Configuration for the integration orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Samples kept per component for the rolling score.
    pub history_window: usize,
    /// Re-enqueue unsynced rows that have no queued mutation.
    pub auto_repair: bool,
    /// Prefetch queue fill (percent) that triggers a recommendation.
    pub prefetch_warn_pct: f64,
    /// Persisted cache purges that trigger a recommendation.
    pub cache_purge_warn: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            history_window: 10,
            auto_repair: true,
            prefetch_warn_pct: 80.0,
            cache_purge_warn: 100,
        }
    }
}

/// Configuration for the whole engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Sync coordinator settings.
    pub sync: SyncConfig,
    /// Write queue settings.
    pub queue: QueueConfig,
    /// Realtime settings.
    pub realtime: RealtimeConfig,
    /// Cache settings.
    pub cache: CacheConfig,
    /// Prefetch settings.
    pub prefetch: PrefetchConfig,
    /// Orchestrator settings.
    pub orchestrator: OrchestratorConfig,
}

impl EngineConfig {
    /// Sets the sync configuration.
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Sets the queue configuration.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the realtime configuration.
    pub fn with_realtime(mut self, realtime: RealtimeConfig) -> Self {
        self.realtime = realtime;
        self
    }

    /// Sets the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the prefetch configuration.
    pub fn with_prefetch(mut self, prefetch: PrefetchConfig) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets the orchestrator configuration.
    pub fn with_orchestrator(mut self, orchestrator: OrchestratorConfig) -> Self {
        self.orchestrator = orchestrator;
        self
    }
}
