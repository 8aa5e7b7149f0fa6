//! Cache command implementation.

use super::open_store;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tidepool_engine::cache::{CacheEntry, KEY_PREFIX};
use tidepool_engine::{CacheCleanupReport, CacheConfig, Clock, SystemClock, TieredCacheManager};
use tidepool_storage::KeyValueStore;

/// Persisted cache statistics.
#[derive(Debug, Default, Serialize)]
pub struct CacheReport {
    /// Persisted entries.
    pub entries: usize,
    /// Entries past their TTL.
    pub expired: usize,
    /// Entries stored compressed.
    pub compressed: usize,
    /// Entries that could not be parsed.
    pub unparsable: usize,
    /// Total stored bytes.
    pub bytes: usize,
    /// Per-domain statistics.
    pub domains: BTreeMap<String, DomainStats>,
    /// Cleanup outcome (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CacheCleanupReport>,
}

/// Statistics for a single cache domain.
#[derive(Debug, Default, Serialize)]
pub struct DomainStats {
    /// Persisted entries.
    pub entries: usize,
    /// Entries past their TTL.
    pub expired: usize,
    /// Stored bytes.
    pub bytes: usize,
}

/// Scans the persisted cache entries of `store`.
pub fn analyze(store: &dyn KeyValueStore, now: i64) -> Result<CacheReport, Box<dyn std::error::Error>> {
    let mut report = CacheReport::default();

    for (key, raw) in store.scan_prefix(KEY_PREFIX)? {
        report.entries += 1;
        report.bytes += raw.len();

        let domain = key[KEY_PREFIX.len()..]
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string();
        let stats = report.domains.entry(domain).or_default();
        stats.entries += 1;
        stats.bytes += raw.len();

        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => {
                if entry.is_expired(now) {
                    report.expired += 1;
                    stats.expired += 1;
                }
                if entry.compressed {
                    report.compressed += 1;
                }
            }
            Err(_) => report.unparsable += 1,
        }
    }

    Ok(report)
}

/// Runs the cache command.
pub fn run(path: &Path, cleanup: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut report = analyze(store.as_ref(), clock.now_millis())?;

    if cleanup {
        let cache = TieredCacheManager::new(CacheConfig::default(), clock, Arc::clone(&store));
        report.cleanup = Some(cache.perform_intelligent_cleanup());
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    Ok(())
}

fn print_text_output(report: &CacheReport) {
    println!("Persisted Cache");
    println!("===============");
    println!("Entries:     {}", report.entries);
    println!("Expired:     {}", report.expired);
    println!("Compressed:  {}", report.compressed);
    println!("Unparsable:  {}", report.unparsable);
    println!("Size:        {} bytes", report.bytes);

    if !report.domains.is_empty() {
        println!();
        println!("Domains:");
        for (name, stats) in &report.domains {
            println!(
                "  {:<16} {:>6} entries  {:>6} expired  {:>10} bytes",
                name, stats.entries, stats.expired, stats.bytes
            );
        }
    }

    if let Some(cleanup) = &report.cleanup {
        println!();
        println!(
            "Cleanup purged {} entries ({} expired, {} unparsable)",
            cleanup.persisted_purged(),
            cleanup.persisted_expired,
            cleanup.unparsable
        );
        if cleanup.storage_error {
            println!("Warning: the store failed during cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_storage::InMemoryStore;

    #[test]
    fn counts_entries_per_domain() {
        let live = CacheEntry {
            key: "u-1".into(),
            value: "{}".into(),
            created_at: 1_000,
            ttl_ms: 10_000,
            compressed: true,
        };
        let stale = CacheEntry {
            created_at: 0,
            ttl_ms: 500,
            compressed: false,
            ..live.clone()
        };
        let store = InMemoryStore::with_entries([
            ("cache:profiles:u-1", serde_json::to_string(&live).unwrap()),
            ("cache:profiles:u-2", serde_json::to_string(&stale).unwrap()),
            ("cache:tasks:list", "not json".to_string()),
            ("queue:1", "{}".to_string()),
        ]);

        let report = analyze(&store, 2_000).unwrap();
        assert_eq!(report.entries, 3);
        assert_eq!(report.expired, 1);
        assert_eq!(report.compressed, 1);
        assert_eq!(report.unparsable, 1);
        assert_eq!(report.domains["profiles"].entries, 2);
        assert_eq!(report.domains["tasks"].entries, 1);
    }
}
