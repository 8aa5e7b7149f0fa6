//! Offline write queue.
//!
//! Every local write becomes an [`OutboundMutation`] persisted under
//! `queue:{id}` in the durable store and held in memory. Mutations are
//! pushed in priority-then-FIFO order, in fixed-size batches with bounded
//! concurrency, and always end `Synced` or `Failed`:
//!
//! - accepted writes are `Synced`
//! - refused writes are settled by the [`ConflictResolver`] and `Synced`
//! - failed writes back off exponentially and become `Failed` once their
//!   attempts are exhausted or the failure is not retryable
//!
//! `Failed` mutations leave the active queue but stay inspectable until
//! retried by hand. `Synced` mutations are archived once past retention.

mod push;

pub use push::{FlushHandler, FlushReport, MutationOutcome, MutationPusher};

use crate::clock::{duration_millis, Clock};
use crate::config::QueueConfig;
use crate::conflict::ConflictResolver;
use crate::error::{EngineError, EngineResult};
use crate::local_store::LocalStore;
use crate::observable::Observable;
use crate::timer::ScheduledTask;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tidepool_protocol::timestamp::millis_to_canonical;
use tidepool_protocol::{
    Conflict, MutationAction, MutationStatus, MutationSummary, OutboundMutation, Priority, Table,
};
use tidepool_storage::{KeyValueStore, WriteOp};
use tracing::{debug, error, info, warn};

/// Durable key prefix of queued mutations.
pub const QUEUE_PREFIX: &str = "queue:";

/// Durable key prefix of archived mutation summaries.
pub const ARCHIVE_PREFIX: &str = "archive:";

fn queue_key(id: &str) -> String {
    format!("{QUEUE_PREFIX}{id}")
}

fn archive_key(id: &str) -> String {
    format!("{ARCHIVE_PREFIX}{id}")
}

/// Counts published on every queue change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Mutations waiting to be pushed.
    pub pending: usize,
    /// Mutations in an in-flight push.
    pub in_flight: usize,
    /// Mutations that exhausted their attempts.
    pub failed: usize,
    /// Synced mutations not yet archived.
    pub synced: usize,
    /// Connectivity as last reported.
    pub online: bool,
    /// Time of the last processing pass.
    pub last_flush_at: Option<i64>,
    /// Last push error.
    pub last_error: Option<String>,
}

impl QueueStatus {
    /// Mutations still in the active queue.
    pub fn active(&self) -> usize {
        self.pending + self.in_flight
    }
}

/// Result of one archive batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Mutations moved to the archive.
    pub archived: usize,
    /// More mutations are past retention.
    pub has_more: bool,
}

/// The durable outbound write queue.
pub struct OfflineWriteQueue {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn KeyValueStore>,
    local: Arc<dyn LocalStore>,
    resolver: Arc<dyn ConflictResolver>,
    items: Mutex<BTreeMap<String, OutboundMutation>>,
    next_sequence: AtomicU64,
    online: AtomicBool,
    flush_timer: ScheduledTask,
    retry_timer: ScheduledTask,
    handler: RwLock<Option<Weak<dyn FlushHandler>>>,
    processing: tokio::sync::Mutex<()>,
    status: Observable<QueueStatus>,
}

impl OfflineWriteQueue {
    /// Opens the queue, restoring persisted mutations.
    ///
    /// Mutations caught in flight by a crash return to `Pending`;
    /// unparsable entries are skipped.
    pub fn open(
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KeyValueStore>,
        local: Arc<dyn LocalStore>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> EngineResult<Self> {
        let mut items = BTreeMap::new();
        let mut max_sequence = 0;
        for (key, raw) in store.scan_prefix(QUEUE_PREFIX)? {
            match serde_json::from_str::<OutboundMutation>(&raw) {
                Ok(mut mutation) => {
                    if mutation.status == MutationStatus::Sent {
                        mutation.status = MutationStatus::Pending;
                    }
                    max_sequence = max_sequence.max(mutation.sequence);
                    items.insert(mutation.id.clone(), mutation);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping unparsable queued mutation"),
            }
        }
        if !items.is_empty() {
            info!(restored = items.len(), "restored write queue");
        }

        let queue = Self {
            config,
            clock,
            store,
            local,
            resolver,
            items: Mutex::new(items),
            next_sequence: AtomicU64::new(max_sequence + 1),
            online: AtomicBool::new(true),
            flush_timer: ScheduledTask::new("queue-flush"),
            retry_timer: ScheduledTask::new("queue-retry"),
            handler: RwLock::new(None),
            processing: tokio::sync::Mutex::new(()),
            status: Observable::default(),
        };
        queue.publish();
        Ok(queue)
    }

    /// Connects the handler that performs flushes.
    pub fn set_flush_handler(&self, handler: Weak<dyn FlushHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Returns the status stream.
    pub fn status(&self) -> &Observable<QueueStatus> {
        &self.status
    }

    /// Returns the number of active mutations.
    pub fn len(&self) -> usize {
        self.items.lock().values().filter(|m| m.is_active()).count()
    }

    /// Returns true if no mutation is active.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true while connectivity is up.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Records a connectivity change.
    ///
    /// Going from offline to online flushes immediately.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            info!(active = self.len(), "connectivity restored; flushing queue");
            self.arm_flush(&self.flush_timer, Duration::ZERO, true);
        } else if !online && was_online {
            info!("connectivity lost; queue paused");
            self.flush_timer.cancel();
            self.retry_timer.cancel();
        }
        self.publish();
    }

    /// Queues a local write and schedules a debounced flush.
    ///
    /// Returns the mutation id.
    pub fn enqueue(
        &self,
        entity_type: Table,
        entity_id: impl Into<String>,
        action: MutationAction,
        payload: Value,
        priority: Priority,
    ) -> EngineResult<String> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let mutation = OutboundMutation::new(
            entity_type,
            entity_id,
            action,
            payload,
            priority,
            self.clock.now_millis(),
            sequence,
        );
        self.store
            .put(&queue_key(&mutation.id), &serde_json::to_string(&mutation)?)?;

        let id = mutation.id.clone();
        debug!(
            mutation_id = %id,
            table = %mutation.entity_type,
            entity_id = %mutation.entity_id,
            action = ?mutation.action,
            "mutation queued"
        );
        self.items.lock().insert(id.clone(), mutation);
        self.publish();
        self.schedule_flush();
        Ok(id)
    }

    /// Writes a new message locally and queues it at high priority.
    ///
    /// Returns the mutation id; the message id is its `entity_id`.
    pub fn enqueue_message(
        &self,
        conversation_id: &str,
        content: &str,
        sender_id: &str,
    ) -> EngineResult<String> {
        let now = millis_to_canonical(self.clock.now_millis());
        let message_id = uuid::Uuid::new_v4().to_string();
        let data = json!({
            "id": message_id,
            "conversation_id": conversation_id,
            "sender_id": sender_id,
            "content": content,
            "created_at": now,
            "updated_at": now,
        });
        self.local.create(Table::Messages, data.clone())?;
        self.enqueue(
            Table::Messages,
            message_id,
            MutationAction::Create,
            data,
            Priority::High,
        )
    }

    /// Schedules a debounced flush while online.
    ///
    /// Calls inside the debounce window push the deadline back.
    pub fn schedule_flush(&self) -> bool {
        if !self.is_online() {
            debug!("offline; flush not scheduled");
            return false;
        }
        self.arm_flush(&self.flush_timer, self.config.debounce, true)
    }

    fn arm_flush(&self, timer: &ScheduledTask, delay: Duration, replace: bool) -> bool {
        let Some(handler) = self.handler.read().clone() else {
            debug!("no flush handler connected");
            return false;
        };
        let action = move || async move {
            let Some(handler) = handler.upgrade() else {
                return;
            };
            match handler.flush_requested().await {
                Ok(report) if report.deferred => debug!("flush deferred"),
                Ok(report) => debug!(
                    synced = report.synced,
                    conflicts = report.conflicts,
                    retried = report.retried,
                    failed = report.failed,
                    "queue flushed"
                ),
                Err(e) => warn!(error = %e, "queue flush failed"),
            }
        };
        if replace {
            timer.schedule(delay, action)
        } else {
            timer.schedule_if_idle(delay, action)
        }
    }

    /// Pushes every ready mutation through `pusher`.
    ///
    /// Returns a deferred report without pushing if another pass is
    /// running.
    pub async fn process_pending(&self, pusher: &dyn MutationPusher) -> EngineResult<FlushReport> {
        let Ok(_guard) = self.processing.try_lock() else {
            debug!("queue processing already running");
            return Ok(FlushReport::deferred());
        };

        let now = self.clock.now_millis();
        let ready = {
            let mut items = self.items.lock();
            let mut ready: Vec<OutboundMutation> = items
                .values()
                .filter(|m| m.is_ready(now))
                .cloned()
                .collect();
            ready.sort_by_key(OutboundMutation::queue_key);
            for mutation in &mut ready {
                mutation.status = MutationStatus::Sent;
                if let Some(item) = items.get_mut(&mutation.id) {
                    item.status = MutationStatus::Sent;
                }
            }
            ready
        };
        if ready.is_empty() {
            self.schedule_retry();
            return Ok(FlushReport::default());
        }
        let mut in_flight = InFlight {
            queue: self,
            ids: ready.iter().map(|m| m.id.clone()).collect(),
        };
        self.publish();

        let batches: Vec<Vec<OutboundMutation>> = ready
            .chunks(self.config.batch_size.max(1))
            .map(<[OutboundMutation]>::to_vec)
            .collect();
        debug!(
            mutations = ready.len(),
            batches = batches.len(),
            "pushing queued mutations"
        );

        let results: Vec<(Vec<OutboundMutation>, Vec<(String, MutationOutcome)>)> =
            stream::iter(batches)
                .map(|batch| async move {
                    let outcomes = pusher.push_batch(&batch).await;
                    (batch, outcomes)
                })
                .buffered(self.config.concurrency.max(1))
                .collect()
                .await;

        let now = self.clock.now_millis();
        let mut report = FlushReport::default();
        let mut updated = Vec::with_capacity(ready.len());
        for (batch, outcomes) in results {
            let mut outcomes: HashMap<String, MutationOutcome> = outcomes.into_iter().collect();
            for mut mutation in batch {
                let outcome = outcomes
                    .remove(&mutation.id)
                    .unwrap_or_else(|| MutationOutcome::retryable("no outcome reported"));
                self.apply_outcome(&mut mutation, outcome, now, &mut report);
                updated.push(mutation);
            }
        }

        self.persist(&updated);
        let last_error = updated.iter().rev().find_map(|m| m.last_error.clone());
        {
            let mut items = self.items.lock();
            for mutation in updated {
                items.insert(mutation.id.clone(), mutation);
            }
        }
        in_flight.ids.clear();
        self.status.update(|s| {
            s.last_flush_at = Some(now);
            if last_error.is_some() {
                s.last_error = last_error;
            }
        });
        self.publish();
        self.schedule_retry();
        Ok(report)
    }

    fn apply_outcome(
        &self,
        mutation: &mut OutboundMutation,
        outcome: MutationOutcome,
        now: i64,
        report: &mut FlushReport,
    ) {
        match outcome {
            MutationOutcome::Synced => {
                mutation.status = MutationStatus::Synced;
                mutation.synced_at = Some(now);
                mutation.last_error = None;
                report.synced += 1;
            }
            MutationOutcome::Conflict { server_record } => {
                let conflict = Conflict::from_push_rejection(
                    mutation.entity_type,
                    mutation.entity_id.clone(),
                    Some(mutation.payload.clone()),
                    server_record,
                    mutation.id.clone(),
                );
                let resolution = self.resolver.resolve(conflict);
                if let Some(write) = resolution.write {
                    if let Err(e) = self.local.apply(vec![write]) {
                        self.fail_attempt(mutation, &e.to_string(), e.is_retryable(), now, report);
                        return;
                    }
                }
                mutation.status = MutationStatus::Synced;
                mutation.synced_at = Some(now);
                report.conflicts += 1;
            }
            MutationOutcome::Failed { error, retryable } => {
                self.fail_attempt(mutation, &error, retryable, now, report);
            }
        }
    }

    fn fail_attempt(
        &self,
        mutation: &mut OutboundMutation,
        error: &str,
        retryable: bool,
        now: i64,
        report: &mut FlushReport,
    ) {
        mutation.retry_count += 1;
        mutation.last_error = Some(error.to_string());

        if !retryable || !self.config.retry.allows_retry(mutation.retry_count) {
            mutation.status = MutationStatus::Failed;
            mutation.next_attempt_at = None;
            report.failed += 1;
            error!(
                mutation_id = %mutation.id,
                table = %mutation.entity_type,
                entity_id = %mutation.entity_id,
                attempts = mutation.retry_count,
                retryable,
                error,
                "mutation failed permanently"
            );
            return;
        }

        let delay = self.config.retry.delay_for_attempt(mutation.retry_count);
        mutation.status = MutationStatus::Pending;
        mutation.next_attempt_at = Some(now + duration_millis(delay));
        report.retried += 1;
        warn!(
            mutation_id = %mutation.id,
            attempt = mutation.retry_count,
            delay_ms = duration_millis(delay),
            error,
            "mutation push failed; will retry"
        );
    }

    fn schedule_retry(&self) {
        if !self.is_online() {
            return;
        }
        let now = self.clock.now_millis();
        let next = self
            .items
            .lock()
            .values()
            .filter(|m| m.status == MutationStatus::Pending)
            .filter_map(|m| m.next_attempt_at)
            .min();
        if let Some(at) = next {
            let delay = Duration::from_millis(u64::try_from(at - now).unwrap_or(0));
            self.arm_flush(&self.retry_timer, delay, true);
        }
    }

    fn persist(&self, mutations: &[OutboundMutation]) {
        let ops: Result<Vec<WriteOp>, serde_json::Error> = mutations
            .iter()
            .map(|m| serde_json::to_string(m).map(|raw| WriteOp::put(queue_key(&m.id), raw)))
            .collect();
        let result = ops
            .map_err(EngineError::from)
            .and_then(|ops| self.store.write_batch(ops).map_err(EngineError::from));
        if let Err(e) = result {
            warn!(count = mutations.len(), error = %e, "failed to persist queue state");
        }
    }

    /// Marks active mutations of an entity `Synced` after a pull replaced
    /// the local row. Returns the number settled.
    pub fn settle_entity(&self, table: Table, entity_id: &str) -> usize {
        let now = self.clock.now_millis();
        let settled: Vec<OutboundMutation> = {
            let mut items = self.items.lock();
            items
                .values_mut()
                .filter(|m| m.is_active() && m.entity_type == table && m.entity_id == entity_id)
                .map(|m| {
                    m.status = MutationStatus::Synced;
                    m.synced_at = Some(now);
                    m.last_error = Some("superseded by server copy".into());
                    m.clone()
                })
                .collect()
        };
        if !settled.is_empty() {
            self.persist(&settled);
            self.publish();
            debug!(table = %table, entity_id, settled = settled.len(), "mutations superseded");
        }
        settled.len()
    }

    /// Returns true if an active mutation targets the entity.
    pub fn has_active_mutation(&self, table: Table, entity_id: &str) -> bool {
        self.items
            .lock()
            .values()
            .any(|m| m.is_active() && m.entity_type == table && m.entity_id == entity_id)
    }

    /// Returns true if a mutation of the entity is waiting for a push.
    pub fn has_pending_mutation(&self, table: Table, entity_id: &str) -> bool {
        self.items.lock().values().any(|m| {
            m.status == MutationStatus::Pending
                && m.entity_type == table
                && m.entity_id == entity_id
        })
    }

    /// Returns a mutation by id.
    pub fn mutation(&self, id: &str) -> Option<OutboundMutation> {
        self.items.lock().get(id).cloned()
    }

    /// Returns every known mutation in queue order, optionally filtered by
    /// status.
    pub fn mutations(&self, status: Option<MutationStatus>) -> Vec<OutboundMutation> {
        let mut all: Vec<OutboundMutation> = self
            .items
            .lock()
            .values()
            .filter(|m| status.map_or(true, |s| m.status == s))
            .cloned()
            .collect();
        all.sort_by_key(OutboundMutation::queue_key);
        all
    }

    /// Returns mutations that exhausted their attempts.
    pub fn failed_mutations(&self) -> Vec<OutboundMutation> {
        self.mutations(Some(MutationStatus::Failed))
    }

    /// Returns a failed mutation to the active queue with a fresh attempt
    /// budget.
    pub fn retry_failed(&self, id: &str) -> EngineResult<()> {
        let mutation = {
            let mut items = self.items.lock();
            let mutation = items
                .get_mut(id)
                .filter(|m| m.status == MutationStatus::Failed)
                .ok_or_else(|| EngineError::NotFound(format!("failed mutation {id}")))?;
            mutation.status = MutationStatus::Pending;
            mutation.retry_count = 0;
            mutation.next_attempt_at = None;
            mutation.clone()
        };
        self.store
            .put(&queue_key(id), &serde_json::to_string(&mutation)?)?;
        info!(mutation_id = id, "failed mutation returned to queue");
        self.publish();
        self.schedule_flush();
        Ok(())
    }

    /// Archives one batch of synced mutations older than the retention
    /// window.
    pub fn cleanup_synced(&self) -> EngineResult<CleanupReport> {
        let cutoff = self.clock.now_millis() - duration_millis(self.config.retention);
        let mut expired: Vec<OutboundMutation> = self
            .items
            .lock()
            .values()
            .filter(|m| m.status == MutationStatus::Synced)
            .filter(|m| m.synced_at.unwrap_or(m.created_at) < cutoff)
            .cloned()
            .collect();
        expired.sort_by_key(|m| (m.created_at, m.sequence));

        let has_more = expired.len() > self.config.cleanup_batch;
        expired.truncate(self.config.cleanup_batch);
        if expired.is_empty() {
            return Ok(CleanupReport::default());
        }

        let mut ops = Vec::with_capacity(expired.len() * 2);
        for mutation in &expired {
            ops.push(WriteOp::put(
                archive_key(&mutation.id),
                serde_json::to_string(&mutation.summary())?,
            ));
            ops.push(WriteOp::delete(queue_key(&mutation.id)));
        }
        self.store.write_batch(ops)?;

        {
            let mut items = self.items.lock();
            for mutation in &expired {
                items.remove(&mutation.id);
            }
        }
        info!(archived = expired.len(), has_more, "archived synced mutations");
        self.publish();
        Ok(CleanupReport {
            archived: expired.len(),
            has_more,
        })
    }

    /// Returns archived summaries; unparsable entries are skipped.
    pub fn archived(&self) -> EngineResult<Vec<MutationSummary>> {
        let mut summaries = Vec::new();
        for (key, raw) in self.store.scan_prefix(ARCHIVE_PREFIX)? {
            match serde_json::from_str::<MutationSummary>(&raw) {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(key = %key, error = %e, "skipping unparsable archive entry"),
            }
        }
        summaries.sort_by_key(|s| s.created_at);
        Ok(summaries)
    }

    fn publish(&self) {
        let online = self.is_online();
        let counts = {
            let items = self.items.lock();
            let mut counts = [0usize; 4];
            for mutation in items.values() {
                let slot = match mutation.status {
                    MutationStatus::Pending => 0,
                    MutationStatus::Sent => 1,
                    MutationStatus::Failed => 2,
                    MutationStatus::Synced => 3,
                };
                counts[slot] += 1;
            }
            counts
        };
        self.status.update(|s| {
            s.pending = counts[0];
            s.in_flight = counts[1];
            s.failed = counts[2];
            s.synced = counts[3];
            s.online = online;
        });
    }
}

/// Returns mutations still `Sent` to `Pending` when a processing pass is
/// dropped before its outcomes are recorded.
struct InFlight<'a> {
    queue: &'a OfflineWriteQueue,
    ids: Vec<String>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        let requeued = {
            let mut items = self.queue.items.lock();
            let mut count = 0;
            for id in &self.ids {
                if let Some(m) = items.get_mut(id) {
                    if m.status == MutationStatus::Sent {
                        m.status = MutationStatus::Pending;
                        count += 1;
                    }
                }
            }
            count
        };
        warn!(requeued, "processing pass abandoned; in-flight mutations requeued");
        self.queue.publish();
    }
}

impl std::fmt::Debug for OfflineWriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineWriteQueue")
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}
