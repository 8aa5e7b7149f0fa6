//! Health aggregation and maintenance.
//!
//! The [`IntegrationOrchestrator`] subscribes to the status stream of every
//! component, keeps a rolling health score per component and publishes an
//! aggregate [`HealthReport`]. It also runs the periodic optimization pass
//! and the fan-out operations that touch every component at once.

use crate::cache::{CacheCleanupReport, CacheStats, TieredCacheManager};
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::local_store::{LocalStore, RowStatus};
use crate::observable::{Observable, Subscription};
use crate::prefetch::{PrefetchScheduler, PrefetchStats};
use crate::queue::{OfflineWriteQueue, QueueStatus};
use crate::realtime::{RealtimeChannelManager, RealtimeMetrics};
use crate::sync::{SyncCoordinator, SyncOptions, SyncState, SyncStats, SyncStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use tidepool_protocol::timestamp::millis_to_canonical;
use tidepool_protocol::{MutationAction, MutationStatus, Priority};
use tracing::{debug, info, warn};

/// Health of one component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentHealth {
    /// Working normally.
    #[default]
    Healthy,
    /// Degraded but making progress.
    Warning,
    /// Failing.
    Error,
    /// Not reachable.
    Offline,
}

impl ComponentHealth {
    /// Score used for the rolling average.
    pub fn score(&self) -> f64 {
        match self {
            ComponentHealth::Healthy => 100.0,
            ComponentHealth::Warning => 60.0,
            ComponentHealth::Error => 20.0,
            ComponentHealth::Offline => 0.0,
        }
    }

    /// Classifies an aggregate score.
    pub fn from_score(score: f64) -> Self {
        if score < 50.0 {
            ComponentHealth::Error
        } else if score < 80.0 {
            ComponentHealth::Warning
        } else {
            ComponentHealth::Healthy
        }
    }
}

/// Components tracked by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Sync coordinator.
    Sync,
    /// Offline write queue.
    Queue,
    /// Realtime channels.
    Realtime,
    /// Tiered cache.
    Cache,
    /// Prefetch scheduler.
    Prefetch,
}

impl Component {
    /// Every component.
    pub const ALL: [Component; 5] = [
        Component::Sync,
        Component::Queue,
        Component::Realtime,
        Component::Cache,
        Component::Prefetch,
    ];

    /// Weight in the overall score. Weights sum to one.
    pub fn weight(&self) -> f64 {
        match self {
            Component::Sync => 0.30,
            Component::Queue => 0.25,
            Component::Realtime => 0.20,
            Component::Cache => 0.15,
            Component::Prefetch => 0.10,
        }
    }
}

/// Classifies a sync status.
pub fn sync_health(status: &SyncStatus) -> ComponentHealth {
    if status.needs_attention() {
        ComponentHealth::Error
    } else if status.state == SyncState::Error {
        ComponentHealth::Warning
    } else {
        ComponentHealth::Healthy
    }
}

/// Classifies a queue status.
pub fn queue_health(status: &QueueStatus) -> ComponentHealth {
    if !status.online {
        ComponentHealth::Offline
    } else if status.failed > 0 || status.last_error.is_some() {
        ComponentHealth::Warning
    } else {
        ComponentHealth::Healthy
    }
}

/// Classifies realtime metrics.
pub fn realtime_health(metrics: &RealtimeMetrics) -> ComponentHealth {
    if metrics.total_channels == 0 {
        ComponentHealth::Healthy
    } else if metrics.offline_channels == metrics.total_channels {
        ComponentHealth::Offline
    } else if metrics.offline_channels > 0 {
        ComponentHealth::Error
    } else if metrics.active_channels < metrics.total_channels
        || metrics.queue_utilization_pct >= 80.0
    {
        ComponentHealth::Warning
    } else {
        ComponentHealth::Healthy
    }
}

/// Classifies cache counters.
pub fn cache_health(stats: &CacheStats) -> ComponentHealth {
    if stats.storage_errors > 0 {
        ComponentHealth::Warning
    } else {
        ComponentHealth::Healthy
    }
}

/// Classifies prefetch counters against the warning threshold.
pub fn prefetch_health(stats: &PrefetchStats, warn_pct: f64) -> ComponentHealth {
    if stats.queue_utilization_pct >= warn_pct || stats.failed > stats.executed.max(1) {
        ComponentHealth::Warning
    } else {
        ComponentHealth::Healthy
    }
}

/// Rolling health of one component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentReport {
    /// Latest classification.
    pub health: ComponentHealth,
    /// Mean score over the history window.
    pub score: f64,
}

/// Aggregate health of the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Status derived from the weighted score.
    pub overall: ComponentHealth,
    /// Weighted mean of the component scores.
    pub score: f64,
    /// Per-component health.
    pub components: BTreeMap<Component, ComponentReport>,
}

/// Result of the consistency check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Unsynced local rows with no active mutation, as `table:id`.
    pub orphaned_rows: Vec<String>,
    /// Orphaned rows re-enqueued.
    pub repaired: usize,
    /// Active mutations whose row is missing locally.
    pub missing_rows: Vec<String>,
}

/// Result of [`IntegrationOrchestrator::perform_optimization`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    /// Cache cleanup outcome.
    pub cache: CacheCleanupReport,
    /// Consistency check outcome.
    pub consistency: ConsistencyReport,
    /// Prefetch tasks queued after the pass.
    pub prefetch_queued: usize,
    /// Prefetch tasks planned by the pass.
    pub prefetch_replanned: usize,
    /// Suggested actions.
    pub recommendations: Vec<String>,
}

/// Result of [`IntegrationOrchestrator::force_sync_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceSyncReport {
    /// Whether the forced sync pass ran and succeeded.
    pub synced: bool,
    /// Realtime channels retried.
    pub channels_reconnected: usize,
    /// Prefetch tasks planned.
    pub prefetch_planned: usize,
}

/// Every component's report in one payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Report time.
    pub generated_at: String,
    /// Aggregate health.
    pub health: HealthReport,
    /// Sync status.
    pub sync: SyncStatus,
    /// Sync counters.
    pub sync_stats: SyncStats,
    /// Queue counts.
    pub queue: QueueStatus,
    /// Realtime metrics.
    pub realtime: RealtimeMetrics,
    /// Cache counters.
    pub cache: CacheStats,
    /// Prefetch counters.
    pub prefetch: PrefetchStats,
}

/// Aggregates health across the engine and runs maintenance.
pub struct IntegrationOrchestrator {
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    local: Arc<dyn LocalStore>,
    sync: Arc<SyncCoordinator>,
    queue: Arc<OfflineWriteQueue>,
    realtime: Arc<RealtimeChannelManager>,
    cache: Arc<TieredCacheManager>,
    prefetch: Arc<PrefetchScheduler>,
    history: Mutex<HashMap<Component, VecDeque<ComponentHealth>>>,
    health: Observable<HealthReport>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl IntegrationOrchestrator {
    /// Creates an orchestrator subscribed to every component.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        clock: Arc<dyn Clock>,
        local: Arc<dyn LocalStore>,
        sync: Arc<SyncCoordinator>,
        queue: Arc<OfflineWriteQueue>,
        realtime: Arc<RealtimeChannelManager>,
        cache: Arc<TieredCacheManager>,
        prefetch: Arc<PrefetchScheduler>,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            config,
            clock,
            local,
            sync,
            queue,
            realtime,
            cache,
            prefetch,
            history: Mutex::new(HashMap::new()),
            health: Observable::new(build_report(&HashMap::new())),
            subscriptions: Mutex::new(Vec::new()),
        });
        orchestrator.subscribe_all();
        orchestrator
    }

    fn subscribe_all(self: &Arc<Self>) {
        let warn_pct = self.config.prefetch_warn_pct;
        let subscriptions = vec![
            self.watch(self.sync.status(), Component::Sync, sync_health),
            self.watch(self.queue.status(), Component::Queue, queue_health),
            self.watch(self.realtime.status(), Component::Realtime, realtime_health),
            self.watch(self.cache.status(), Component::Cache, cache_health),
            self.watch(self.prefetch.status(), Component::Prefetch, move |stats| {
                prefetch_health(stats, warn_pct)
            }),
        ];
        *self.subscriptions.lock() = subscriptions;
    }

    fn watch<T>(
        self: &Arc<Self>,
        source: &Observable<T>,
        component: Component,
        classify: impl Fn(&T) -> ComponentHealth + Send + Sync + 'static,
    ) -> Subscription
    where
        T: Clone + Send + Sync + 'static,
    {
        let me: Weak<Self> = Arc::downgrade(self);
        source.subscribe(move |value| {
            if let Some(orchestrator) = me.upgrade() {
                orchestrator.record(component, classify(value));
            }
        })
    }

    /// Adds a health sample for `component` and republishes the report.
    pub fn record(&self, component: Component, health: ComponentHealth) {
        let report = {
            let mut history = self.history.lock();
            let samples = history.entry(component).or_default();
            samples.push_back(health);
            while samples.len() > self.config.history_window.max(1) {
                samples.pop_front();
            }
            build_report(&history)
        };
        if report.overall != self.health.get().overall {
            info!(overall = ?report.overall, score = report.score, "engine health changed");
        }
        self.health.set(report);
    }

    /// Returns the current aggregate health.
    pub fn health(&self) -> HealthReport {
        self.health.get()
    }

    /// Returns the aggregate health stream.
    pub fn status(&self) -> &Observable<HealthReport> {
        &self.health
    }

    /// Runs cache cleanup, the consistency check and the prefetch queue
    /// evaluation in sequence.
    pub fn perform_optimization(&self) -> OptimizationReport {
        let mut report = OptimizationReport {
            cache: self.cache.perform_intelligent_cleanup(),
            ..OptimizationReport::default()
        };
        let purged = report.cache.persisted_purged();
        if purged >= self.config.cache_purge_warn {
            report.recommendations.push(format!(
                "cache cleanup purged {purged} persisted entries; consider shorter TTLs"
            ));
        }
        if report.cache.storage_error {
            report
                .recommendations
                .push("durable cache storage is failing; cached reads fall back to the network".into());
        }

        report.consistency = self.check_consistency();
        let orphaned = report.consistency.orphaned_rows.len();
        if orphaned > report.consistency.repaired {
            report.recommendations.push(format!(
                "{} unsynced rows have no queued mutation; enable auto-repair",
                orphaned - report.consistency.repaired
            ));
        }
        if !report.consistency.missing_rows.is_empty() {
            report.recommendations.push(format!(
                "{} queued mutations reference rows missing locally",
                report.consistency.missing_rows.len()
            ));
        }

        let prefetch = self.prefetch.stats();
        if prefetch.queue_utilization_pct >= self.config.prefetch_warn_pct {
            report.recommendations.push(format!(
                "prefetch queue at {:.0}% of capacity; prefetching is falling behind",
                prefetch.queue_utilization_pct
            ));
        } else if prefetch.queued == 0 {
            report.prefetch_replanned = self.prefetch.replan();
        }
        report.prefetch_queued = self.prefetch.stats().queued;

        let queue = self.queue.status().get();
        if queue.failed > 0 {
            report.recommendations.push(format!(
                "{} mutations failed permanently; inspect and retry them",
                queue.failed
            ));
        }
        if let Some(message) = self.sync.status().get().message {
            report.recommendations.push(message);
        }
        let realtime = self.realtime.metrics();
        if realtime.offline_channels > 0 {
            report.recommendations.push(format!(
                "{} realtime channels are offline",
                realtime.offline_channels
            ));
        }

        info!(
            purged,
            orphaned,
            repaired = report.consistency.repaired,
            recommendations = report.recommendations.len(),
            "optimization pass complete"
        );
        report
    }

    /// Finds unsynced rows without an active mutation and active mutations
    /// without a row. Re-enqueues orphans when auto-repair is on.
    pub fn check_consistency(&self) -> ConsistencyReport {
        let mut report = ConsistencyReport::default();

        match self.local.unsynced_rows() {
            Ok(rows) => {
                for row in rows {
                    if self.queue.has_active_mutation(row.table, &row.id) {
                        continue;
                    }
                    report.orphaned_rows.push(format!("{}:{}", row.table, row.id));
                    if !self.config.auto_repair {
                        continue;
                    }
                    let action = match row.status {
                        RowStatus::Created => MutationAction::Create,
                        RowStatus::Deleted => MutationAction::Delete,
                        RowStatus::Updated | RowStatus::Synced => MutationAction::Update,
                    };
                    match self
                        .queue
                        .enqueue(row.table, row.id.clone(), action, row.data, Priority::Normal)
                    {
                        Ok(_) => report.repaired += 1,
                        Err(e) => warn!(table = %row.table, id = %row.id, error = %e, "auto-repair failed"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "consistency check could not read local rows"),
        }

        let active = self
            .queue
            .mutations(Some(MutationStatus::Pending))
            .into_iter()
            .chain(self.queue.mutations(Some(MutationStatus::Sent)));
        for mutation in active {
            if mutation.action == MutationAction::Delete {
                continue;
            }
            match self.local.get(mutation.entity_type, &mutation.entity_id) {
                Ok(Some(_)) => {}
                Ok(None) => report.missing_rows.push(mutation.id),
                Err(e) => debug!(mutation_id = %mutation.id, error = %e, "row lookup failed"),
            }
        }

        if !report.orphaned_rows.is_empty() || !report.missing_rows.is_empty() {
            warn!(
                orphaned = report.orphaned_rows.len(),
                repaired = report.repaired,
                missing = report.missing_rows.len(),
                "local store and queue disagree"
            );
        }
        report
    }

    /// Forces a sync pass, retries every disconnected channel and replans
    /// prefetching.
    pub async fn force_sync_all(&self, user_id: &str) -> ForceSyncReport {
        let synced = self.sync.sync(user_id, SyncOptions::forced()).await;
        let channels_reconnected = self.realtime.reconnect_all().await;
        let prefetch_planned = self.prefetch.replan();
        info!(synced, channels_reconnected, prefetch_planned, "forced sync of all components");
        ForceSyncReport {
            synced,
            channels_reconnected,
            prefetch_planned,
        }
    }

    /// Combines every component's report.
    pub fn get_diagnostics(&self) -> Diagnostics {
        Diagnostics {
            generated_at: millis_to_canonical(self.clock.now_millis()),
            health: self.health(),
            sync: self.sync.status().get(),
            sync_stats: self.sync.stats(),
            queue: self.queue.status().get(),
            realtime: self.realtime.metrics(),
            cache: self.cache.stats(),
            prefetch: self.prefetch.stats(),
        }
    }
}

fn build_report(history: &HashMap<Component, VecDeque<ComponentHealth>>) -> HealthReport {
    let mut components = BTreeMap::new();
    let mut score = 0.0;
    for component in Component::ALL {
        let report = match history.get(&component) {
            Some(samples) if !samples.is_empty() => ComponentReport {
                health: samples.back().copied().unwrap_or_default(),
                score: samples.iter().map(ComponentHealth::score).sum::<f64>()
                    / samples.len() as f64,
            },
            _ => ComponentReport {
                health: ComponentHealth::Healthy,
                score: ComponentHealth::Healthy.score(),
            },
        };
        score += report.score * component.weight();
        components.insert(component, report);
    }
    HealthReport {
        overall: ComponentHealth::from_score(score),
        score,
        components,
    }
}

impl fmt::Debug for IntegrationOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationOrchestrator")
            .field("health", &self.health.get().overall)
            .finish_non_exhaustive()
    }
}
