//! Tiered cache.
//!
//! The [`TieredCacheManager`] keeps a fast in-process layer per domain and,
//! for persisted domains, mirrors every entry into the durable
//! [`KeyValueStore`]. Reads check memory first and fall back to the store,
//! repopulating memory on a hit.
//!
//! The cache is advisory: every storage failure degrades to a miss or a
//! memory-only write and is logged, never returned.

mod assets;
mod compression;
mod dedup;
mod entry;
mod grouping;

pub use assets::{extract_asset_urls, AssetPrefetcher};
pub use compression::{compress, decompress, Compressed};
pub use dedup::{content_hash, dedup_collection};
pub use entry::CacheEntry;
pub use grouping::{group_by_window, TimeGroup};

use crate::clock::{duration_millis, Clock};
use crate::config::{CacheConfig, CacheDomain};
use crate::observable::{EventFeed, Observable};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tidepool_storage::{KeyValueStore, WriteOp};
use tracing::{debug, info, warn};

/// Prefix of every persisted cache key.
pub const KEY_PREFIX: &str = "cache:";

/// Field used to place items into time windows.
const GROUP_FIELD: &str = "created_at";

/// Why entries were invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    /// A caller asked for it.
    Explicit,
    /// A sync pass changed the underlying rows.
    Sync,
    /// A realtime row change arrived.
    Remote,
}

/// Emitted whenever cached data is invalidated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheInvalidation {
    /// Affected domain.
    pub domain: String,
    /// Affected key, `None` for the whole domain.
    pub key: Option<String>,
    /// Cause.
    pub reason: InvalidationReason,
    /// Time of the invalidation in milliseconds.
    pub at: i64,
}

/// Running cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Reads served from memory or storage.
    pub hits: u64,
    /// Reads served from memory.
    pub memory_hits: u64,
    /// Reads served from the durable store.
    pub persisted_hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Entries written.
    pub writes: u64,
    /// Entries written to the durable store.
    pub persisted_writes: u64,
    /// Entries written compressed.
    pub compressed_writes: u64,
    /// Collection items dropped as duplicates.
    pub deduplicated: u64,
    /// Storage operations that failed and were degraded.
    pub storage_errors: u64,
    /// Entries held in memory.
    pub memory_entries: usize,
    /// Invalidation events emitted.
    pub invalidations: u64,
}

impl CacheStats {
    /// Fraction of reads that hit, 1.0 when nothing was read.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            1.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Outcome of one [`TieredCacheManager::cache`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheWrite {
    /// Whether the payload was compressed.
    pub compressed: bool,
    /// Whether the entry reached the durable store.
    pub persisted: bool,
    /// Duplicates dropped from a collection.
    pub deduplicated: usize,
    /// Asset URLs forwarded to the prefetcher.
    pub assets_forwarded: usize,
}

/// Outcome of [`TieredCacheManager::perform_intelligent_cleanup`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCleanupReport {
    /// Expired entries dropped from memory.
    pub memory_expired: usize,
    /// Persisted entries purged for age or TTL.
    pub persisted_expired: usize,
    /// Persisted entries purged because they could not be parsed.
    pub unparsable: usize,
    /// Whether the durable store failed during the pass.
    pub storage_error: bool,
}

impl CacheCleanupReport {
    /// Persisted entries removed.
    pub fn persisted_purged(&self) -> usize {
        self.persisted_expired + self.unparsable
    }
}

fn persisted_key(domain: &str, key: &str) -> String {
    format!("{KEY_PREFIX}{domain}:{key}")
}

fn groups_key(key: &str) -> String {
    format!("{key}:groups")
}

/// Two-level cache over memory and the durable store.
pub struct TieredCacheManager {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn KeyValueStore>,
    memory: RwLock<HashMap<String, HashMap<String, CacheEntry>>>,
    stats: Observable<CacheStats>,
    invalidations: EventFeed<CacheInvalidation>,
    prefetcher: RwLock<Option<Weak<dyn AssetPrefetcher>>>,
}

impl TieredCacheManager {
    /// Creates a cache over `store`.
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            config,
            clock,
            store,
            memory: RwLock::new(HashMap::new()),
            stats: Observable::default(),
            invalidations: EventFeed::default(),
            prefetcher: RwLock::new(None),
        }
    }

    /// Connects the asset prefetcher that receives extracted URLs.
    pub fn set_asset_prefetcher(&self, prefetcher: Weak<dyn AssetPrefetcher>) {
        *self.prefetcher.write() = Some(prefetcher);
    }

    fn policy(&self, domain: &str) -> CacheDomain {
        self.config
            .domain(domain)
            .cloned()
            .unwrap_or_else(|| CacheDomain::memory(domain, self.config.default_ttl))
    }

    /// Caches `value` under `domain`/`key`.
    ///
    /// `ttl` falls back to the domain default. Collections in dedup domains
    /// are deduplicated first; grouping domains also store a time-window
    /// summary readable through [`get_grouped`](Self::get_grouped).
    pub fn cache(&self, domain: &str, key: &str, value: Value, ttl: Option<Duration>) -> CacheWrite {
        let policy = self.policy(domain);
        let now = self.clock.now_millis();
        let ttl_ms = duration_millis(ttl.unwrap_or(policy.default_ttl));
        let mut report = CacheWrite::default();

        let value = match value {
            Value::Array(items) if policy.dedup => {
                let (kept, dropped) = dedup_collection(items);
                report.deduplicated = dropped;
                Value::Array(kept)
            }
            other => other,
        };

        let entry = self.build_entry(key, &value, now, ttl_ms);
        report.compressed = entry.compressed;
        report.persisted = self.write_entry(&policy, entry);

        if let (Value::Array(items), Some(window)) = (&value, policy.group_window) {
            let groups = group_by_window(items, GROUP_FIELD, window);
            match serde_json::to_value(&groups) {
                Ok(summary) => {
                    let entry = self.build_entry(&groups_key(key), &summary, now, ttl_ms);
                    self.write_entry(&policy, entry);
                }
                Err(e) => warn!(domain, key, error = %e, "failed to encode time groups"),
            }
        }

        self.stats.update(|s| s.deduplicated += report.deduplicated as u64);
        report.assets_forwarded = self.forward_assets(&value);
        report
    }

    fn build_entry(&self, key: &str, value: &Value, now: i64, ttl_ms: i64) -> CacheEntry {
        let packed = compress(&value.to_string(), self.config.compression_threshold);
        CacheEntry {
            key: key.to_string(),
            value: packed.content,
            created_at: now,
            ttl_ms,
            compressed: packed.compressed,
        }
    }

    fn write_entry(&self, policy: &CacheDomain, entry: CacheEntry) -> bool {
        let compressed = entry.compressed;
        let persisted = if policy.persisted {
            let key = persisted_key(&policy.name, &entry.key);
            let written = serde_json::to_string(&entry)
                .map_err(|e| e.to_string())
                .and_then(|raw| self.store.put(&key, &raw).map_err(|e| e.to_string()));
            match written {
                Ok(()) => true,
                Err(error) => {
                    warn!(domain = %policy.name, key = %entry.key, %error, "cache persist failed; kept in memory");
                    self.stats.update(|s| s.storage_errors += 1);
                    false
                }
            }
        } else {
            false
        };

        let memory_entries = {
            let mut memory = self.memory.write();
            memory
                .entry(policy.name.clone())
                .or_default()
                .insert(entry.key.clone(), entry);
            memory.values().map(HashMap::len).sum()
        };

        self.stats.update(|s| {
            s.writes += 1;
            s.persisted_writes += u64::from(persisted);
            s.compressed_writes += u64::from(compressed);
            s.memory_entries = memory_entries;
        });
        persisted
    }

    fn forward_assets(&self, value: &Value) -> usize {
        let urls = extract_asset_urls(value);
        if urls.is_empty() {
            return 0;
        }
        let prefetcher = self.prefetcher.read().as_ref().and_then(Weak::upgrade);
        match prefetcher {
            Some(prefetcher) => {
                let count = urls.len();
                prefetcher.enqueue_assets(urls);
                count
            }
            None => {
                debug!(count = urls.len(), "no asset prefetcher; urls dropped");
                0
            }
        }
    }

    /// Reads `domain`/`key`.
    ///
    /// Expired, unparsable and unreadable entries are misses.
    pub fn get(&self, domain: &str, key: &str) -> Option<Value> {
        let policy = self.policy(domain);
        let now = self.clock.now_millis();

        let cached = self
            .memory
            .read()
            .get(domain)
            .and_then(|entries| entries.get(key))
            .cloned();
        if let Some(entry) = cached {
            if !entry.is_expired(now) {
                if let Some(value) = entry.decode() {
                    self.stats.update(|s| {
                        s.hits += 1;
                        s.memory_hits += 1;
                    });
                    return Some(value);
                }
            }
            self.remove_from_memory(domain, key);
        }

        if policy.persisted {
            if let Some((entry, value)) = self.load_persisted(domain, key, now) {
                let memory_entries = {
                    let mut memory = self.memory.write();
                    memory
                        .entry(domain.to_string())
                        .or_default()
                        .insert(key.to_string(), entry);
                    memory.values().map(HashMap::len).sum()
                };
                self.stats.update(|s| {
                    s.hits += 1;
                    s.persisted_hits += 1;
                    s.memory_entries = memory_entries;
                });
                return Some(value);
            }
        }

        self.stats.update(|s| s.misses += 1);
        None
    }

    fn load_persisted(&self, domain: &str, key: &str, now: i64) -> Option<(CacheEntry, Value)> {
        let storage_key = persisted_key(domain, key);
        let raw = match self.store.get(&storage_key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(domain, key, error = %e, "cache read failed; treating as miss");
                self.stats.update(|s| s.storage_errors += 1);
                return None;
            }
        };

        let decoded = serde_json::from_str::<CacheEntry>(&raw)
            .ok()
            .and_then(|entry| entry.decode().map(|value| (entry, value)));
        match decoded {
            Some((entry, value)) if !entry.is_expired(now) => Some((entry, value)),
            Some(_) => {
                self.delete_persisted(&storage_key);
                None
            }
            None => {
                warn!(domain, key, "unparsable cache entry removed");
                self.delete_persisted(&storage_key);
                None
            }
        }
    }

    fn delete_persisted(&self, storage_key: &str) {
        if let Err(e) = self.store.write_batch(vec![WriteOp::delete(storage_key)]) {
            warn!(key = storage_key, error = %e, "failed to delete cache entry");
            self.stats.update(|s| s.storage_errors += 1);
        }
    }

    fn remove_from_memory(&self, domain: &str, key: &str) -> bool {
        let (removed, memory_entries) = {
            let mut memory = self.memory.write();
            let removed = memory
                .get_mut(domain)
                .map(|entries| {
                    let main = entries.remove(key).is_some();
                    entries.remove(&groups_key(key));
                    main
                })
                .unwrap_or(false);
            (removed, memory.values().map(HashMap::len).sum())
        };
        self.stats.update(|s| s.memory_entries = memory_entries);
        removed
    }

    /// Reads the time-window summary stored with a grouped collection.
    pub fn get_grouped(&self, domain: &str, key: &str) -> Option<Vec<TimeGroup>> {
        let summary = self.get(domain, &groups_key(key))?;
        serde_json::from_value(summary).ok()
    }

    /// Drops one entry from both tiers. Returns true if it existed.
    pub fn invalidate(&self, domain: &str, key: &str, reason: InvalidationReason) -> bool {
        let mut existed = self.remove_from_memory(domain, key);
        if self.policy(domain).persisted {
            let storage_key = persisted_key(domain, key);
            match self.store.get(&storage_key) {
                Ok(found) => existed |= found.is_some(),
                Err(e) => warn!(domain, key, error = %e, "cache read failed during invalidation"),
            }
            let ops = vec![
                WriteOp::delete(storage_key),
                WriteOp::delete(persisted_key(domain, &groups_key(key))),
            ];
            if let Err(e) = self.store.write_batch(ops) {
                warn!(domain, key, error = %e, "failed to invalidate persisted entry");
                self.stats.update(|s| s.storage_errors += 1);
            }
        }
        self.emit(domain, Some(key), reason);
        existed
    }

    /// Drops every entry of a domain from both tiers. Returns the number of
    /// distinct keys removed.
    pub fn invalidate_domain(&self, domain: &str, reason: InvalidationReason) -> usize {
        let mut removed: HashSet<String> = {
            let mut memory = self.memory.write();
            memory
                .remove(domain)
                .map(|entries| entries.into_keys().collect())
                .unwrap_or_default()
        };

        if self.policy(domain).persisted {
            let prefix = persisted_key(domain, "");
            match self.store.scan_prefix(&prefix) {
                Ok(entries) => {
                    let ops: Vec<WriteOp> = entries
                        .into_iter()
                        .map(|(storage_key, _)| {
                            removed.insert(storage_key[prefix.len()..].to_string());
                            WriteOp::delete(storage_key)
                        })
                        .collect();
                    if !ops.is_empty() {
                        if let Err(e) = self.store.write_batch(ops) {
                            warn!(domain, error = %e, "failed to invalidate persisted domain");
                            self.stats.update(|s| s.storage_errors += 1);
                        }
                    }
                }
                Err(e) => {
                    warn!(domain, error = %e, "cache scan failed during invalidation");
                    self.stats.update(|s| s.storage_errors += 1);
                }
            }
        }

        let memory_entries = self.memory_len();
        self.stats.update(|s| s.memory_entries = memory_entries);
        self.emit(domain, None, reason);
        debug!(domain, removed = removed.len(), ?reason, "cache domain invalidated");
        removed.len()
    }

    fn emit(&self, domain: &str, key: Option<&str>, reason: InvalidationReason) {
        self.stats.update(|s| s.invalidations += 1);
        self.invalidations.emit(CacheInvalidation {
            domain: domain.to_string(),
            key: key.map(str::to_string),
            reason,
            at: self.clock.now_millis(),
        });
    }

    /// Purges expired memory entries and stale or unparsable persisted
    /// entries.
    pub fn perform_intelligent_cleanup(&self) -> CacheCleanupReport {
        let now = self.clock.now_millis();
        let retention_ms = duration_millis(self.config.retention);
        let mut report = CacheCleanupReport::default();

        {
            let mut memory = self.memory.write();
            for entries in memory.values_mut() {
                let before = entries.len();
                entries.retain(|_, entry| !entry.is_expired(now));
                report.memory_expired += before - entries.len();
            }
            memory.retain(|_, entries| !entries.is_empty());
        }

        match self.store.scan_prefix(KEY_PREFIX) {
            Ok(entries) => {
                let mut ops = Vec::new();
                let (mut expired, mut unparsable) = (0, 0);
                for (storage_key, raw) in entries {
                    match serde_json::from_str::<CacheEntry>(&raw) {
                        Ok(entry) if entry.is_expired(now) || entry.age(now) > retention_ms => {
                            expired += 1;
                            ops.push(WriteOp::delete(storage_key));
                        }
                        Ok(_) => {}
                        Err(_) => {
                            unparsable += 1;
                            ops.push(WriteOp::delete(storage_key));
                        }
                    }
                }
                if !ops.is_empty() {
                    match self.store.write_batch(ops) {
                        Ok(()) => {
                            report.persisted_expired = expired;
                            report.unparsable = unparsable;
                        }
                        Err(e) => {
                            warn!(error = %e, "cache cleanup could not delete entries");
                            report.storage_error = true;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "cache cleanup could not scan storage");
                report.storage_error = true;
            }
        }

        let memory_entries = self.memory_len();
        self.stats.update(|s| {
            s.memory_entries = memory_entries;
            s.storage_errors += u64::from(report.storage_error);
        });
        info!(
            memory_expired = report.memory_expired,
            persisted_expired = report.persisted_expired,
            unparsable = report.unparsable,
            "cache cleanup finished"
        );
        report
    }

    /// Returns the number of entries held in memory.
    pub fn memory_len(&self) -> usize {
        self.memory.read().values().map(HashMap::len).sum()
    }

    /// Drops the in-process layer; the durable layer is untouched.
    pub fn clear_memory(&self) {
        self.memory.write().clear();
        self.stats.update(|s| s.memory_entries = 0);
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        self.stats.get()
    }

    /// Returns the stats stream.
    pub fn status(&self) -> &Observable<CacheStats> {
        &self.stats
    }

    /// Subscribes to invalidation events.
    pub fn subscribe_invalidations(&self) -> Receiver<CacheInvalidation> {
        self.invalidations.subscribe()
    }

    /// Returns up to `limit` recent invalidation events.
    pub fn recent_invalidations(&self, limit: usize) -> Vec<CacheInvalidation> {
        self.invalidations.recent(limit)
    }
}

impl std::fmt::Debug for TieredCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCacheManager")
            .field("memory_entries", &self.memory_len())
            .field("stats", &self.stats.get())
            .finish_non_exhaustive()
    }
}
