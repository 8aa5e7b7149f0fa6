//! Sync coordinator.
//!
//! A pass pulls remote changes since the stored [`SyncCursor`], applies
//! them to the local store in one transaction, then pushes the write
//! queue. At most one pass runs at a time: callers that find the lock
//! held get `false` back immediately, and a pass that outlives the lock
//! timeout is abandoned.

mod state;

pub use state::{SyncOptions, SyncState, SyncStats, SyncStatus};

use crate::cache::{InvalidationReason, TieredCacheManager};
use crate::clock::{duration_millis, Clock};
use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::error::{EngineError, EngineResult};
use crate::local_store::{LocalStore, LocalWrite};
use crate::observable::Observable;
use crate::queue::{FlushHandler, FlushReport, MutationOutcome, MutationPusher, OfflineWriteQueue};
use crate::remote::RemoteBackend;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tidepool_protocol::{
    sanitize_record, ChangeSet, Conflict, MutationAction, OutboundMutation, PullRequest,
    PushRequest, PushResponse, Record, SyncCursor, Table,
};
use tidepool_storage::KeyValueStore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CURSOR_KEY: &str = "sync:cursor";
const LAST_SUCCESS_KEY: &str = "sync:last_success";

/// What a pull applied.
#[derive(Debug, Default)]
struct PullSummary {
    pulled: u64,
    conflicts: u64,
}

/// Local writes planned from one change set.
#[derive(Debug, Default)]
struct ApplyPlan {
    writes: Vec<LocalWrite>,
    settled: Vec<(Table, String)>,
    touched: BTreeSet<Table>,
    pulled: u64,
    conflicts: u64,
}

/// Drives pull and push passes against the backend.
pub struct SyncCoordinator {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    remote: Arc<dyn RemoteBackend>,
    local: Arc<dyn LocalStore>,
    store: Arc<dyn KeyValueStore>,
    queue: Arc<OfflineWriteQueue>,
    resolver: Arc<dyn ConflictResolver>,
    cache: Option<Arc<TieredCacheManager>>,
    lock: tokio::sync::Mutex<()>,
    cursor: Mutex<SyncCursor>,
    user_id: RwLock<Option<String>>,
    push_failed: AtomicBool,
    stats: RwLock<SyncStats>,
    status: Observable<SyncStatus>,
}

impl SyncCoordinator {
    /// Creates a coordinator, restoring the cursor and last-success time.
    pub fn new(
        config: SyncConfig,
        clock: Arc<dyn Clock>,
        remote: Arc<dyn RemoteBackend>,
        local: Arc<dyn LocalStore>,
        store: Arc<dyn KeyValueStore>,
        queue: Arc<OfflineWriteQueue>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> EngineResult<Self> {
        let cursor = match store.get(CURSOR_KEY)? {
            Some(raw) => raw.trim().parse().map(SyncCursor::new).unwrap_or_else(|_| {
                warn!(raw = %raw, "stored cursor is invalid; starting over");
                SyncCursor::INITIAL
            }),
            None => SyncCursor::INITIAL,
        };
        let last_success_at = store
            .get(LAST_SUCCESS_KEY)?
            .and_then(|raw| raw.trim().parse::<i64>().ok());

        let status = Observable::new(SyncStatus {
            cursor: cursor.value(),
            last_success_at,
            ..SyncStatus::default()
        });

        Ok(Self {
            config,
            clock,
            remote,
            local,
            store,
            queue,
            resolver,
            cache: None,
            lock: tokio::sync::Mutex::new(()),
            cursor: Mutex::new(cursor),
            user_id: RwLock::new(None),
            push_failed: AtomicBool::new(false),
            stats: RwLock::new(SyncStats::default()),
            status,
        })
    }

    /// Invalidates cache domains of tables changed by a pull.
    pub fn with_cache(mut self, cache: Arc<TieredCacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Registers this coordinator as the queue's flush handler.
    pub fn attach_to_queue(self: &Arc<Self>) {
        let handler: Weak<dyn FlushHandler> = Arc::downgrade(self) as Weak<dyn FlushHandler>;
        self.queue.set_flush_handler(handler);
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        self.status.get().state
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns the status stream.
    pub fn status(&self) -> &Observable<SyncStatus> {
        &self.status
    }

    /// Returns the cursor of the last applied pull.
    pub fn cursor(&self) -> SyncCursor {
        *self.cursor.lock()
    }

    /// Returns the time of the last successful pass.
    pub fn last_success_at(&self) -> Option<i64> {
        self.status.get().last_success_at
    }

    /// Returns true while a pass holds the lock.
    pub fn is_syncing(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    fn set_state(&self, state: SyncState) {
        self.status.update(|s| s.state = state);
    }

    /// Runs one pass for `user_id`.
    ///
    /// Returns false without touching the network when throttled, when
    /// another pass holds the lock, or when the pass fails or times out.
    pub async fn sync(&self, user_id: &str, options: SyncOptions) -> bool {
        *self.user_id.write() = Some(user_id.to_string());

        if !options.force {
            if let Some(last) = self.last_success_at() {
                let elapsed = self.clock.now_millis() - last;
                let min_interval = duration_millis(self.config.min_interval);
                if elapsed < min_interval {
                    debug!(elapsed_ms = elapsed, min_interval_ms = min_interval, "sync throttled");
                    self.stats.write().throttled += 1;
                    self.set_state(SyncState::Throttled);
                    return false;
                }
            }
        }

        let Ok(_guard) = self.lock.try_lock() else {
            info!(user_id, "sync already in progress");
            self.stats.write().contended += 1;
            return false;
        };

        match self.with_deadline(self.run_pass(user_id, options)).await {
            Ok(summary) => {
                self.record_success();
                info!(
                    user_id,
                    pulled = summary.pulled,
                    conflicts = summary.conflicts,
                    cursor = self.cursor().value(),
                    "sync completed"
                );
                true
            }
            Err(e) => {
                self.record_failure(&e);
                false
            }
        }
    }

    async fn with_deadline<T>(&self, pass: impl Future<Output = EngineResult<T>>) -> EngineResult<T> {
        match tokio::time::timeout(self.config.lock_timeout, pass).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    timeout_ms = duration_millis(self.config.lock_timeout),
                    "sync pass exceeded the lock timeout; lock force-released"
                );
                self.stats.write().forced_releases += 1;
                Err(EngineError::Timeout)
            }
        }
    }

    async fn run_pass(&self, user_id: &str, options: SyncOptions) -> EngineResult<PullSummary> {
        self.push_failed.store(false, Ordering::SeqCst);

        self.set_state(SyncState::Pulling);
        let summary = self.pull(user_id, options).await?;

        self.set_state(SyncState::Pushing);
        let report = self.queue.process_pending(self).await?;
        debug!(
            synced = report.synced,
            conflicts = report.conflicts,
            retried = report.retried,
            failed = report.failed,
            "push phase finished"
        );
        if self.push_failed.load(Ordering::SeqCst) {
            return Err(EngineError::transport_retryable(
                "push failed; mutations rescheduled",
            ));
        }
        Ok(summary)
    }

    async fn pull(&self, user_id: &str, options: SyncOptions) -> EngineResult<PullSummary> {
        let store_empty = self.local.is_empty()?;
        if options.is_first_sync && !store_empty {
            warn!(user_id, "first sync requested but local store has data; pulling incrementally");
        }

        let request = if store_empty {
            debug!(user_id, "local store empty; requesting snapshot");
            PullRequest::first_sync(user_id)
        } else {
            PullRequest::incremental(user_id, self.cursor())
        };

        let response = self.remote.pull(request).await?;
        let (changes, next_cursor, unknown) = response.into_change_set(&self.config.tables);
        for table in unknown {
            warn!(table = %table, "ignoring unknown table in pull response");
        }

        let plan = self.plan_apply(&changes)?;
        self.local.apply(plan.writes)?;
        for (table, id) in &plan.settled {
            self.queue.settle_entity(*table, id);
        }

        self.advance_cursor(next_cursor)?;

        if let Some(cache) = &self.cache {
            for table in &plan.touched {
                cache.invalidate_domain(table.as_str(), InvalidationReason::Sync);
            }
        }

        let mut stats = self.stats.write();
        stats.records_pulled += plan.pulled;
        stats.conflicts_resolved += plan.conflicts;
        Ok(PullSummary {
            pulled: plan.pulled,
            conflicts: plan.conflicts,
        })
    }

    fn plan_apply(&self, changes: &ChangeSet) -> EngineResult<ApplyPlan> {
        let mut plan = ApplyPlan::default();

        for (table, table_changes) in changes.iter() {
            let table = *table;
            for raw in table_changes.created.iter().chain(&table_changes.updated) {
                let record = match Record::decode(table, raw) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(table = %table, error = %e, "skipping invalid pulled record");
                        continue;
                    }
                };
                let id = record.id().to_string();
                plan.touched.insert(table);
                plan.pulled += 1;

                match self.local.get(table, &id)? {
                    Some(row) if row.status.is_unsynced() => {
                        let conflict =
                            Conflict::from_pull(table, id.clone(), Some(row.data), Some(raw.clone()));
                        let resolution = self.resolver.resolve(conflict);
                        plan.writes.extend(resolution.write);
                        plan.settled.push((table, id));
                        plan.conflicts += 1;
                    }
                    _ => plan.writes.push(LocalWrite::server_row(table, id, raw.clone())),
                }
            }

            for id in &table_changes.deleted {
                let Some(row) = self.local.get(table, id)? else {
                    continue;
                };
                plan.touched.insert(table);
                plan.pulled += 1;
                if row.status.is_unsynced() {
                    let conflict = Conflict::from_pull(table, id.clone(), Some(row.data), None);
                    let resolution = self.resolver.resolve(conflict);
                    plan.writes.extend(resolution.write);
                    plan.settled.push((table, id.clone()));
                    plan.conflicts += 1;
                } else {
                    plan.writes.push(LocalWrite::Remove {
                        table,
                        id: id.clone(),
                    });
                }
            }
        }
        Ok(plan)
    }

    fn advance_cursor(&self, next: SyncCursor) -> EngineResult<()> {
        let value = {
            let mut cursor = self.cursor.lock();
            if !cursor.advance(next) {
                warn!(
                    current = cursor.value(),
                    received = next.value(),
                    "backend cursor regressed; keeping current"
                );
                return Ok(());
            }
            cursor.value()
        };
        self.store.put(CURSOR_KEY, &value.to_string())?;
        self.status.update(|s| s.cursor = value);
        Ok(())
    }

    fn record_success(&self) {
        let now = self.clock.now_millis();
        if let Err(e) = self.store.put(LAST_SUCCESS_KEY, &now.to_string()) {
            warn!(error = %e, "failed to persist last sync time");
        }
        self.stats.write().cycles_completed += 1;
        self.status.update(|s| {
            s.state = SyncState::Synced;
            s.consecutive_failures = 0;
            s.last_success_at = Some(now);
            s.message = None;
        });
    }

    fn record_failure(&self, error: &EngineError) {
        {
            let mut stats = self.stats.write();
            stats.cycles_failed += 1;
            stats.last_error = Some(error.to_string());
        }
        let threshold = self.config.failure_alert_threshold;
        self.status.update(|s| {
            s.state = SyncState::Error;
            s.consecutive_failures += 1;
            if s.consecutive_failures >= threshold {
                s.message = Some(format!("sync failed {} times", s.consecutive_failures));
            }
        });
        warn!(
            error = %error,
            retryable = error.is_retryable(),
            consecutive_failures = self.status.get().consecutive_failures,
            "sync failed"
        );
    }

    /// Runs `sync` every `interval` until the coordinator is dropped or the
    /// handle is aborted.
    pub fn spawn_periodic_sync(self: &Arc<Self>, user_id: impl Into<String>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let user_id = user_id.into();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                coordinator.sync(&user_id, SyncOptions::default()).await;
            }
        })
    }

    async fn push_once(&self, request: PushRequest) -> EngineResult<PushResponse> {
        let response = self.remote.push(request).await?;
        if response.success {
            Ok(response)
        } else {
            Err(EngineError::ServerError(
                response.error.unwrap_or_else(|| "push rejected".into()),
            ))
        }
    }

    async fn push_with_retry(&self, request: PushRequest) -> EngineResult<PushResponse> {
        match self.push_once(request.clone()).await {
            Err(e) if e.is_retryable() => {
                warn!(
                    error = %e,
                    delay_ms = duration_millis(self.config.push_retry_delay),
                    "push failed; retrying once"
                );
                self.stats.write().retries += 1;
                tokio::time::sleep(self.config.push_retry_delay).await;
                self.push_once(request).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl MutationPusher for SyncCoordinator {
    async fn push_batch(&self, batch: &[OutboundMutation]) -> Vec<(String, MutationOutcome)> {
        let user_id = self.user_id.read().clone().unwrap_or_default();
        let now = self.clock.now();
        let mut changes = ChangeSet::with_tables(&self.config.tables);
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut pushed: Vec<&OutboundMutation> = Vec::with_capacity(batch.len());

        for mutation in batch {
            if mutation.action == MutationAction::Delete {
                changes
                    .table_mut(mutation.entity_type)
                    .deleted
                    .push(mutation.entity_id.clone());
                pushed.push(mutation);
                continue;
            }
            match sanitize_record(mutation.entity_type, &mutation.payload, now) {
                Ok(sanitized) => {
                    if sanitized.report.has_repairs() {
                        warn!(
                            mutation_id = %mutation.id,
                            table = %mutation.entity_type,
                            fields = ?sanitized.report.repaired_timestamps,
                            "repaired malformed timestamps"
                        );
                    }
                    let table = changes.table_mut(mutation.entity_type);
                    let bucket = match mutation.action {
                        MutationAction::Create => &mut table.created,
                        _ => &mut table.updated,
                    };
                    bucket.push(sanitized.into_value());
                    pushed.push(mutation);
                }
                Err(e) => {
                    error!(
                        mutation_id = %mutation.id,
                        table = %mutation.entity_type,
                        entity_id = %mutation.entity_id,
                        error = %e,
                        "rejecting mutation with invalid record"
                    );
                    outcomes.push((mutation.id.clone(), MutationOutcome::rejected(e.to_string())));
                }
            }
        }

        if pushed.is_empty() {
            return outcomes;
        }

        changes.normalize(&self.config.tables);
        let request = PushRequest {
            changes,
            last_cursor: self.cursor(),
            user_id,
        };

        match self.push_with_retry(request).await {
            Ok(response) => {
                let mut synced = Vec::new();
                for mutation in pushed {
                    match response.conflict_for(mutation.entity_type, &mutation.entity_id) {
                        Some(conflict) => outcomes.push((
                            mutation.id.clone(),
                            MutationOutcome::Conflict {
                                server_record: conflict.server_record.clone(),
                            },
                        )),
                        None => {
                            if !self
                                .queue
                                .has_pending_mutation(mutation.entity_type, &mutation.entity_id)
                            {
                                synced.push(LocalWrite::MarkSynced {
                                    table: mutation.entity_type,
                                    id: mutation.entity_id.clone(),
                                });
                            }
                            outcomes.push((mutation.id.clone(), MutationOutcome::Synced));
                        }
                    }
                }
                let accepted = outcomes
                    .iter()
                    .filter(|(_, o)| *o == MutationOutcome::Synced)
                    .count() as u64;
                self.stats.write().mutations_pushed += accepted;
                if let Err(e) = self.local.apply(synced) {
                    warn!(error = %e, "failed to mark pushed rows synced");
                }
            }
            Err(e) => {
                self.push_failed.store(true, Ordering::SeqCst);
                self.stats.write().last_error = Some(e.to_string());
                let retryable = e.is_retryable();
                for mutation in pushed {
                    outcomes.push((
                        mutation.id.clone(),
                        MutationOutcome::Failed {
                            error: e.to_string(),
                            retryable,
                        },
                    ));
                }
            }
        }
        outcomes
    }
}

#[async_trait]
impl FlushHandler for SyncCoordinator {
    async fn flush_requested(&self) -> EngineResult<FlushReport> {
        let Ok(_guard) = self.lock.try_lock() else {
            debug!("sync in progress; flush deferred");
            self.queue.schedule_flush();
            return Ok(FlushReport::deferred());
        };
        self.set_state(SyncState::Pushing);
        let result = self
            .with_deadline(self.queue.process_pending(self))
            .await;
        let state = match &result {
            Ok(_) if !self.push_failed.swap(false, Ordering::SeqCst) => SyncState::Synced,
            _ => SyncState::Error,
        };
        self.set_state(state);
        result
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("status", &self.status.get())
            .field("stats", &*self.stats.read())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QueueConfig;
    use crate::conflict::ServerWins;
    use crate::local_store::{MemoryLocalStore, RowStatus};
    use crate::remote::MockRemote;
    use serde_json::json;
    use tidepool_protocol::{
        MutationStatus, PullResponse, PushConflict, PushConflictKind, TableChanges,
    };
    use tidepool_storage::InMemoryStore;

    struct Fixture {
        clock: Arc<ManualClock>,
        remote: Arc<MockRemote>,
        local: Arc<MemoryLocalStore>,
        store: Arc<InMemoryStore>,
        queue: Arc<OfflineWriteQueue>,
        sync: Arc<SyncCoordinator>,
    }

    fn fixture_with(store: Arc<InMemoryStore>, local: Arc<MemoryLocalStore>) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let remote = Arc::new(MockRemote::new());
        let queue = Arc::new(
            OfflineWriteQueue::open(
                QueueConfig::default(),
                Arc::clone(&clock) as Arc<dyn Clock>,
                Arc::clone(&store) as Arc<dyn KeyValueStore>,
                Arc::clone(&local) as Arc<dyn LocalStore>,
                Arc::new(ServerWins),
            )
            .unwrap(),
        );
        let sync = Arc::new(
            SyncCoordinator::new(
                SyncConfig::default(),
                Arc::clone(&clock) as Arc<dyn Clock>,
                Arc::clone(&remote) as Arc<dyn RemoteBackend>,
                Arc::clone(&local) as Arc<dyn LocalStore>,
                Arc::clone(&store) as Arc<dyn KeyValueStore>,
                Arc::clone(&queue),
                Arc::new(ServerWins),
            )
            .unwrap(),
        );
        Fixture {
            clock,
            remote,
            local,
            store,
            queue,
            sync,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(InMemoryStore::new()), Arc::new(MemoryLocalStore::new()))
    }

    fn seeded() -> Fixture {
        let local = Arc::new(MemoryLocalStore::new());
        local
            .seed(Table::Profiles, json!({"id": "u-1", "display_name": "Ada"}))
            .unwrap();
        fixture_with(Arc::new(InMemoryStore::new()), local)
    }

    fn changes(table: Table, changes: TableChanges, cursor: u64) -> PullResponse {
        let mut set = ChangeSet::new();
        *set.table_mut(table) = changes;
        PullResponse::changes(&set, SyncCursor::new(cursor))
    }

    #[tokio::test]
    async fn empty_store_requests_snapshot() {
        let f = fixture();
        assert!(f.sync.sync("u-1", SyncOptions::default()).await);
        let requests = f.remote.pull_requests();
        assert!(requests[0].turbo);
        assert_eq!(f.sync.state(), SyncState::Synced);
    }

    #[tokio::test]
    async fn first_sync_flag_ignored_when_store_has_data() {
        let f = seeded();
        let options = SyncOptions {
            force: true,
            is_first_sync: true,
        };
        assert!(f.sync.sync("u-1", options).await);
        assert!(!f.remote.pull_requests()[0].turbo);
    }

    #[tokio::test]
    async fn throttles_inside_min_interval() {
        let f = seeded();
        assert!(f.sync.sync("u-1", SyncOptions::default()).await);
        let calls = f.remote.total_calls();

        f.clock.advance(Duration::from_secs(10));
        assert!(!f.sync.sync("u-1", SyncOptions::default()).await);
        assert_eq!(f.remote.total_calls(), calls);
        assert_eq!(f.sync.state(), SyncState::Throttled);

        assert!(f.sync.sync("u-1", SyncOptions::forced()).await);
        f.clock.advance(Duration::from_secs(31));
        assert!(f.sync.sync("u-1", SyncOptions::default()).await);
        assert_eq!(f.sync.stats().throttled, 1);
    }

    #[tokio::test]
    async fn pull_applies_and_persists_cursor() {
        let f = seeded();
        f.remote.push_pull_response(changes(
            Table::Tasks,
            TableChanges {
                created: vec![
                    json!({"id": "t-1", "owner_id": "u-1", "title": "a"}),
                    json!({"id": "t-bad", "owner_id": ""}),
                ],
                ..TableChanges::default()
            },
            7,
        ));
        assert!(f.sync.sync("u-1", SyncOptions::forced()).await);
        assert_eq!(f.local.count(Table::Tasks).unwrap(), 1);
        assert_eq!(f.sync.cursor(), SyncCursor::new(7));
        assert_eq!(f.store.get(CURSOR_KEY).unwrap().as_deref(), Some("7"));
        assert_eq!(f.sync.stats().records_pulled, 1);

        // Cursor survives a restart.
        let restarted = fixture_with(Arc::clone(&f.store), Arc::clone(&f.local));
        assert_eq!(restarted.sync.cursor(), SyncCursor::new(7));
        assert!(restarted.sync.last_success_at().is_some());
    }

    #[tokio::test]
    async fn pull_conflict_server_wins() {
        let f = seeded();
        f.local
            .create(Table::Tasks, json!({"id": "t-1", "owner_id": "u-1", "title": "mine"}))
            .unwrap();
        let mutation_id = f
            .queue
            .enqueue(
                Table::Tasks,
                "t-1",
                MutationAction::Create,
                json!({"id": "t-1", "owner_id": "u-1", "title": "mine"}),
                Default::default(),
            )
            .unwrap();
        let remote_row = json!({"id": "t-1", "owner_id": "u-1", "title": "theirs"});
        f.remote.push_pull_response(changes(
            Table::Tasks,
            TableChanges {
                updated: vec![remote_row.clone()],
                ..TableChanges::default()
            },
            3,
        ));

        assert!(f.sync.sync("u-1", SyncOptions::forced()).await);
        let row = f.local.get(Table::Tasks, "t-1").unwrap().unwrap();
        assert_eq!(row.data, remote_row);
        assert_eq!(row.status, RowStatus::Synced);
        assert_eq!(
            f.queue.mutation(&mutation_id).unwrap().status,
            MutationStatus::Synced
        );
        assert_eq!(f.queue.len(), 0);
        assert_eq!(f.remote.push_calls(), 0);
        assert_eq!(f.sync.stats().conflicts_resolved, 1);
    }

    #[tokio::test]
    async fn push_sanitizes_and_marks_synced() {
        let f = seeded();
        f.local
            .create(
                Table::Tasks,
                json!({"id": "t-1", "owner_id": "u-1", "due_at": "soon", "_status": "created"}),
            )
            .unwrap();
        f.queue
            .enqueue(
                Table::Tasks,
                "t-1",
                MutationAction::Create,
                json!({"id": "t-1", "owner_id": "u-1", "due_at": "soon", "_status": "created"}),
                Default::default(),
            )
            .unwrap();
        f.queue
            .enqueue(
                Table::Tasks,
                "undefined",
                MutationAction::Update,
                json!({"id": "undefined", "owner_id": "u-1"}),
                Default::default(),
            )
            .unwrap();

        assert!(f.sync.sync("u-1", SyncOptions::forced()).await);

        let pushes = f.remote.push_requests();
        assert_eq!(pushes.len(), 1);
        let tasks = pushes[0].changes.table(Table::Tasks).unwrap();
        assert_eq!(tasks.created.len(), 1);
        assert!(tasks.created[0].get("_status").is_none());
        assert_eq!(tasks.created[0]["due_at"], "2026-01-01T00:00:00.000Z");
        assert!(pushes[0].changes.contains_table(Table::Messages));

        assert_eq!(
            f.local.get(Table::Tasks, "t-1").unwrap().unwrap().status,
            RowStatus::Synced
        );
        assert_eq!(f.queue.failed_mutations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn push_retries_once_then_reschedules() {
        let f = seeded();
        f.queue
            .enqueue(
                Table::Tasks,
                "t-1",
                MutationAction::Update,
                json!({"id": "t-1", "owner_id": "u-1"}),
                Default::default(),
            )
            .unwrap();
        f.remote.fail_pushes(2);

        assert!(!f.sync.sync("u-1", SyncOptions::forced()).await);
        assert_eq!(f.remote.push_calls(), 2);
        assert_eq!(f.sync.stats().retries, 1);
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.sync.status().get().consecutive_failures, 1);
        assert!(f.sync.last_success_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_pass_is_force_released() {
        let f = seeded();
        let before = f.sync.cursor();
        f.remote.push_pull_response(changes(Table::Tasks, TableChanges::default(), 5));
        f.remote.set_delay(Duration::from_secs(40));

        assert!(!f.sync.sync("u-1", SyncOptions::forced()).await);
        assert_eq!(f.sync.stats().forced_releases, 1);
        assert!(!f.sync.is_syncing());
        assert_eq!(f.sync.cursor(), before);
        assert_eq!(f.sync.state(), SyncState::Error);

        f.remote.set_delay(Duration::ZERO);
        assert!(f.sync.sync("u-1", SyncOptions::forced()).await);
        assert_eq!(f.sync.cursor(), SyncCursor::new(5));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_push_requeues_mutations() {
        let f = seeded();
        let id = f
            .queue
            .enqueue(
                Table::Tasks,
                "t-1",
                MutationAction::Update,
                json!({"id": "t-1", "owner_id": "u-1"}),
                Default::default(),
            )
            .unwrap();
        f.remote.set_delay(Duration::from_secs(20));

        assert!(!f.sync.sync("u-1", SyncOptions::forced()).await);
        assert_eq!(f.sync.stats().forced_releases, 1);
        assert_eq!(f.remote.push_calls(), 1);
        assert_eq!(f.queue.mutation(&id).unwrap().status, MutationStatus::Pending);

        f.remote.set_delay(Duration::ZERO);
        assert!(f.sync.sync("u-1", SyncOptions::forced()).await);
        assert_eq!(f.remote.push_calls(), 2);
        assert_eq!(f.queue.mutation(&id).unwrap().status, MutationStatus::Synced);
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn push_conflict_reported_by_backend() {
        let f = seeded();
        let mutation_id = f.queue.enqueue_message("c-1", "hi", "u-1").unwrap();
        let message_id = f.queue.mutation(&mutation_id).unwrap().entity_id;
        let server = json!({"id": message_id, "conversation_id": "c-1", "sender_id": "u-1", "content": "server"});
        f.remote.push_push_response(PushResponse::with_conflicts(vec![PushConflict {
            table: Table::Messages,
            id: message_id.clone(),
            kind: PushConflictKind::UniqueViolation,
            server_record: Some(server.clone()),
        }]));

        assert!(f.sync.sync("u-1", SyncOptions::forced()).await);
        assert_eq!(
            f.local.get(Table::Messages, &message_id).unwrap().unwrap().data,
            server
        );
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn failures_raise_alert_after_threshold() {
        let f = seeded();
        f.remote.fail_pulls(3);
        for _ in 0..3 {
            assert!(!f.sync.sync("u-1", SyncOptions::forced()).await);
        }
        let status = f.sync.status().get();
        assert_eq!(status.state, SyncState::Error);
        assert_eq!(status.message.as_deref(), Some("sync failed 3 times"));

        assert!(f.sync.sync("u-1", SyncOptions::forced()).await);
        assert!(!f.sync.status().get().needs_attention());
    }
}
