//! Prefetch scheduler.

use super::behavior::{Activity, BehaviorProfile};
use super::fetcher::PrefetchFetcher;
use super::strategy::{default_strategies, DeviceState, PrefetchContext, PrefetchStrategy};
use super::task::{Enqueued, PrefetchKind, PrefetchTask, TaskQueue};
use crate::cache::{AssetPrefetcher, TieredCacheManager};
use crate::clock::{duration_millis, Clock};
use crate::config::PrefetchConfig;
use crate::observable::Observable;
use crate::realtime::BoundedQueue;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tidepool_storage::KeyValueStore;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Durable key prefix of behavior profiles.
pub const BEHAVIOR_PREFIX: &str = "behavior:";

fn behavior_key(user_id: &str) -> String {
    format!("{BEHAVIOR_PREFIX}{user_id}")
}

/// Counters published by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrefetchStats {
    /// Tasks added by planning rounds.
    pub planned: u64,
    /// Tasks fetched and cached.
    pub executed: u64,
    /// Failed tasks put back in the queue.
    pub retried: u64,
    /// Tasks dropped after exhausting their retries.
    pub failed: u64,
    /// Tasks dropped unexecuted because they expired.
    pub expired: u64,
    /// Tasks displaced or refused by a full queue.
    pub evicted: u64,
    /// Tasks waiting.
    pub queued: usize,
    /// Queue fill in percent.
    pub queue_utilization_pct: f64,
    /// Asset URLs waiting for an unmetered network.
    pub asset_backlog: usize,
    /// Whether the worker is running.
    pub running: bool,
    /// Time of the last planning round.
    pub last_planned_at: Option<i64>,
}

/// Plans speculative fetches from user behavior and runs them in the
/// background, one at a time.
pub struct PrefetchScheduler {
    me: Weak<Self>,
    config: PrefetchConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn KeyValueStore>,
    cache: Arc<TieredCacheManager>,
    fetcher: Arc<dyn PrefetchFetcher>,
    strategies: Vec<Box<dyn PrefetchStrategy>>,
    queue: Mutex<TaskQueue>,
    profiles: RwLock<HashMap<String, BehaviorProfile>>,
    active_user: RwLock<Option<String>>,
    device: RwLock<DeviceState>,
    assets: Mutex<BoundedQueue<String>>,
    wake: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Observable<PrefetchStats>,
}

impl PrefetchScheduler {
    /// Creates a scheduler with the built-in strategies.
    pub fn new(
        config: PrefetchConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KeyValueStore>,
        cache: Arc<TieredCacheManager>,
        fetcher: Arc<dyn PrefetchFetcher>,
    ) -> Arc<Self> {
        Self::with_strategies(config, clock, store, cache, fetcher, default_strategies())
    }

    /// Creates a scheduler evaluating `strategies` in order.
    pub fn with_strategies(
        config: PrefetchConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KeyValueStore>,
        cache: Arc<TieredCacheManager>,
        fetcher: Arc<dyn PrefetchFetcher>,
        strategies: Vec<Box<dyn PrefetchStrategy>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            queue: Mutex::new(TaskQueue::new(config.queue_cap)),
            assets: Mutex::new(BoundedQueue::new(config.asset_backlog_cap)),
            config,
            clock,
            store,
            cache,
            fetcher,
            strategies,
            profiles: RwLock::new(HashMap::new()),
            active_user: RwLock::new(None),
            device: RwLock::new(DeviceState::default()),
            wake: Arc::new(Notify::new()),
            worker: Mutex::new(None),
            stats: Observable::default(),
        })
    }

    /// Loads or creates the user's profile, plans tasks from every
    /// applicable strategy and starts the worker.
    ///
    /// Returns the number of tasks added. Without a tokio runtime tasks are
    /// planned but only run through [`process_next`](Self::process_next).
    pub fn start_prefetching(&self, user_id: &str) -> usize {
        *self.active_user.write() = Some(user_id.to_string());
        let profile = self.load_profile(user_id);
        let planned = self.plan(&profile);
        self.ensure_worker();
        self.wake.notify_one();
        planned
    }

    /// Runs another planning round for the active user.
    pub fn replan(&self) -> usize {
        let Some(user_id) = self.active_user.read().clone() else {
            return 0;
        };
        let profile = self.load_profile(&user_id);
        let planned = self.plan(&profile);
        if planned > 0 {
            self.wake.notify_one();
        }
        planned
    }

    /// Stops the worker. Queued tasks are kept.
    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
        self.stats.update(|s| s.running = false);
        info!("prefetch worker stopped");
    }

    /// Folds an activity into the user's profile.
    ///
    /// The profile is persisted in the background; failures are logged and
    /// otherwise ignored.
    pub fn update_user_behavior(&self, user_id: &str, activity: &Activity) {
        self.load_profile(user_id);
        let now = self.clock.now();
        {
            let mut profiles = self.profiles.write();
            profiles
                .entry(user_id.to_string())
                .or_insert_with(|| BehaviorProfile::new(user_id))
                .record(activity, now);
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let me = self.me.clone();
                let user_id = user_id.to_string();
                runtime.spawn(async move {
                    if let Some(scheduler) = me.upgrade() {
                        scheduler.persist_profile(&user_id);
                    }
                });
            }
            Err(_) => self.persist_profile(user_id),
        }
    }

    /// Returns the in-memory profile of `user_id`.
    pub fn profile(&self, user_id: &str) -> Option<BehaviorProfile> {
        self.profiles.read().get(user_id).cloned()
    }

    /// Updates the device conditions used by the next planning round.
    pub fn set_device_state(&self, device: DeviceState) {
        *self.device.write() = device;
    }

    /// Returns the current device conditions.
    pub fn device_state(&self) -> DeviceState {
        *self.device.read()
    }

    /// Runs the next queued task.
    ///
    /// Expired tasks are dropped unexecuted. A failed task is put back with
    /// a fresh lifetime until it has been retried `max_attempts` times.
    /// Returns false if the queue was empty.
    pub async fn process_next(&self) -> bool {
        let next = self.queue.lock().pop_next();
        let Some(mut task) = next else {
            return false;
        };

        if task.is_expired(self.clock.now_millis()) {
            debug!(task_id = %task.id, kind = task.kind.as_str(), "prefetch task expired; skipped");
            self.stats.update(|s| s.expired += 1);
            self.publish_queue();
            return true;
        }

        match self.fetcher.fetch(&task.target).await {
            Ok(value) => {
                let (domain, key) = task.target.cache_slot();
                self.cache
                    .cache(domain, key, value, Some(self.config.cache_ttl));
                debug!(task_id = %task.id, kind = task.kind.as_str(), domain, key, "prefetched");
                self.stats.update(|s| s.executed += 1);
            }
            Err(e) => {
                task.attempts += 1;
                if task.attempts <= self.config.max_attempts {
                    task.reset(
                        self.clock.now_millis(),
                        duration_millis(self.config.task_lifetime),
                    );
                    debug!(
                        task_id = %task.id,
                        attempt = task.attempts,
                        error = %e,
                        "prefetch failed; re-enqueued"
                    );
                    self.queue.lock().push(task);
                    self.stats.update(|s| s.retried += 1);
                } else {
                    warn!(
                        task_id = %task.id,
                        kind = task.kind.as_str(),
                        attempts = task.attempts,
                        error = %e,
                        "prefetch task dropped after retries"
                    );
                    self.stats.update(|s| s.failed += 1);
                }
            }
        }
        self.publish_queue();
        true
    }

    /// Returns the queued tasks in execution order.
    pub fn queued_tasks(&self) -> Vec<PrefetchTask> {
        self.queue.lock().snapshot()
    }

    /// Removes every queued task. Returns how many were removed.
    pub fn clear_queue(&self) -> usize {
        let removed = {
            let mut queue = self.queue.lock();
            let removed = queue.len();
            queue.clear();
            removed
        };
        self.publish_queue();
        removed
    }

    /// Returns the asset URLs waiting for an unmetered network.
    pub fn asset_backlog(&self) -> Vec<String> {
        self.assets.lock().iter().cloned().collect()
    }

    /// Returns the current counters.
    pub fn stats(&self) -> PrefetchStats {
        self.stats.get()
    }

    /// Returns the counter stream.
    pub fn status(&self) -> &Observable<PrefetchStats> {
        &self.stats
    }

    fn load_profile(&self, user_id: &str) -> BehaviorProfile {
        if let Some(profile) = self.profiles.read().get(user_id) {
            return profile.clone();
        }
        let loaded = match self.store.get(&behavior_key(user_id)) {
            Ok(Some(raw)) => match serde_json::from_str::<BehaviorProfile>(&raw) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(user_id, error = %e, "unparsable behavior profile; starting fresh");
                    BehaviorProfile::new(user_id)
                }
            },
            Ok(None) => BehaviorProfile::new(user_id),
            Err(e) => {
                warn!(user_id, error = %e, "failed to load behavior profile");
                BehaviorProfile::new(user_id)
            }
        };
        self.profiles
            .write()
            .entry(user_id.to_string())
            .or_insert(loaded)
            .clone()
    }

    fn persist_profile(&self, user_id: &str) {
        let Some(profile) = self.profile(user_id) else {
            return;
        };
        let result = serde_json::to_string(&profile)
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                self.store
                    .put(&behavior_key(user_id), &raw)
                    .map_err(|e| e.to_string())
            });
        if let Err(error) = result {
            warn!(user_id, error = %error, "failed to persist behavior profile");
        }
    }

    fn plan(&self, profile: &BehaviorProfile) -> usize {
        let now = self.clock.now_millis();
        let lifetime = duration_millis(self.config.task_lifetime);
        let backlog = self.asset_backlog();
        let ctx = PrefetchContext {
            device: self.device_state(),
            profile,
            asset_backlog: &backlog,
            now: self.clock.now(),
            config: &self.config,
        };

        let mut added = 0_u64;
        let mut displaced = 0_u64;
        let mut assets_planned = false;
        let pruned = {
            let mut queue = self.queue.lock();
            let pruned = queue.prune_expired(now);
            for strategy in &self.strategies {
                let kind = strategy.kind();
                if !strategy.applies(&ctx) {
                    debug!(strategy = kind.as_str(), "prefetch strategy skipped");
                    continue;
                }
                for planned in strategy.plan(&ctx) {
                    let task = PrefetchTask::new(kind, planned.priority, planned.target, now, lifetime);
                    match queue.push(task) {
                        Enqueued::Added => added += 1,
                        Enqueued::Evicted(_) => {
                            added += 1;
                            displaced += 1;
                        }
                        Enqueued::Rejected => displaced += 1,
                        Enqueued::Duplicate => {}
                    }
                }
                assets_planned |= kind == PrefetchKind::Asset;
            }
            pruned
        };

        if assets_planned && !backlog.is_empty() {
            let mut assets = self.assets.lock();
            let remaining: Vec<String> = assets
                .drain()
                .into_iter()
                .filter(|url| !backlog.contains(url))
                .collect();
            for url in remaining {
                assets.push(url);
            }
        }
        if displaced > 0 {
            warn!(displaced, cap = self.config.queue_cap, "prefetch queue full");
        }
        info!(user_id = %profile.user_id, planned = added, "prefetch planned");
        self.stats.update(|s| {
            s.planned += added;
            s.evicted += displaced;
            s.expired += pruned as u64;
            s.last_planned_at = Some(now);
        });
        self.publish_queue();
        usize::try_from(added).unwrap_or(usize::MAX)
    }

    fn ensure_worker(&self) {
        let started = {
            let mut worker = self.worker.lock();
            if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
                return;
            }
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                debug!("no runtime; prefetch worker not started");
                return;
            };
            *worker = Some(runtime.spawn(Self::run_worker(
                self.me.clone(),
                Arc::clone(&self.wake),
                self.config.inter_task_delay,
            )));
            true
        };
        if started {
            debug!("prefetch worker started");
            self.stats.update(|s| s.running = true);
        }
    }

    async fn run_worker(me: Weak<Self>, wake: Arc<Notify>, delay: Duration) {
        loop {
            let processed = match me.upgrade() {
                Some(scheduler) => scheduler.process_next().await,
                None => return,
            };
            if processed {
                tokio::time::sleep(delay).await;
            } else {
                wake.notified().await;
            }
        }
    }

    fn publish_queue(&self) {
        let (queued, utilization) = {
            let queue = self.queue.lock();
            (queue.len(), queue.utilization_pct())
        };
        let backlog = self.assets.lock().len();
        self.stats.update(|s| {
            s.queued = queued;
            s.queue_utilization_pct = utilization;
            s.asset_backlog = backlog;
        });
    }
}

impl AssetPrefetcher for PrefetchScheduler {
    fn enqueue_assets(&self, urls: Vec<String>) {
        let mut added = 0_usize;
        {
            let mut backlog = self.assets.lock();
            for url in urls {
                if backlog.iter().any(|queued| *queued == url) {
                    continue;
                }
                if let Some(dropped) = backlog.push(url) {
                    debug!(url = %dropped, "asset backlog full; dropped oldest");
                }
                added += 1;
            }
        }
        if added > 0 {
            debug!(added, "assets queued for prefetch");
            self.publish_queue();
        }
    }
}

impl Drop for PrefetchScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for PrefetchScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefetchScheduler")
            .field("queued", &self.queue.lock().len())
            .field("strategies", &self.strategies.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::prefetch::{EntityRef, MockFetcher, NetworkType, PrefetchTarget};
    use serde_json::json;
    use tidepool_protocol::{Priority, Table};
    use tidepool_storage::InMemoryStore;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStore>,
        cache: Arc<TieredCacheManager>,
        fetcher: Arc<MockFetcher>,
        scheduler: Arc<PrefetchScheduler>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(TieredCacheManager::new(
            CacheConfig::default(),
            clock.clone() as Arc<dyn Clock>,
            store.clone() as Arc<dyn KeyValueStore>,
        ));
        let fetcher = Arc::new(MockFetcher::new());
        let scheduler = PrefetchScheduler::new(
            PrefetchConfig::default(),
            clock.clone() as Arc<dyn Clock>,
            store.clone() as Arc<dyn KeyValueStore>,
            Arc::clone(&cache),
            fetcher.clone() as Arc<dyn PrefetchFetcher>,
        );
        Fixture {
            clock,
            store,
            cache,
            fetcher,
            scheduler,
        }
    }

    fn write(table: Table, id: &str) -> Activity {
        Activity::Write {
            entity: EntityRef::new(table, id),
            topic: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn planned_tasks_are_fetched_and_cached() {
        let fx = fixture();
        fx.scheduler
            .update_user_behavior("u-1", &write(Table::Tasks, "t-1"));
        fx.scheduler
            .update_user_behavior("u-1", &Activity::Search { term: "plan".into() });

        assert_eq!(fx.scheduler.start_prefetching("u-1"), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(fx.fetcher.fetched().len(), 2);
        assert!(fx.cache.get("tasks", "t-1").is_some());
        assert!(fx.cache.get("search", "plan").is_some());
        let stats = fx.scheduler.stats();
        assert_eq!(stats.executed, 2);
        assert_eq!(stats.queued, 0);
        assert!(stats.running);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_retried_with_fresh_lifetime() {
        let fx = fixture();
        fx.scheduler
            .update_user_behavior("u-1", &write(Table::Tasks, "t-1"));
        fx.fetcher.fail_next(2);

        fx.scheduler.start_prefetching("u-1");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(fx.fetcher.fetched().len(), 3);
        let stats = fx.scheduler.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let fx = fixture();
        fx.scheduler
            .update_user_behavior("u-1", &write(Table::Tasks, "t-1"));
        fx.fetcher.fail_next(100);

        fx.scheduler.start_prefetching("u-1");
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(fx.fetcher.fetched().len(), 4);
        assert_eq!(fx.scheduler.stats().failed, 1);
        assert!(fx.scheduler.queued_tasks().is_empty());
    }

    #[test]
    fn expired_tasks_are_skipped() {
        let fx = fixture();
        fx.scheduler
            .update_user_behavior("u-1", &write(Table::Tasks, "t-1"));
        assert_eq!(fx.scheduler.start_prefetching("u-1"), 1);

        fx.clock.advance(Duration::from_secs(31 * 60));
        assert!(futures::executor::block_on(fx.scheduler.process_next()));
        assert!(!futures::executor::block_on(fx.scheduler.process_next()));
        assert!(fx.fetcher.fetched().is_empty());
        assert_eq!(fx.scheduler.stats().expired, 1);
    }

    #[test]
    fn low_battery_plans_notifications_only() {
        let fx = fixture();
        fx.scheduler
            .update_user_behavior("u-1", &write(Table::Tasks, "t-1"));
        fx.scheduler.update_user_behavior(
            "u-1",
            &Activity::NotificationOpen {
                entity: EntityRef::new(Table::Messages, "m-1"),
            },
        );
        fx.scheduler.set_device_state(DeviceState {
            battery_pct: 5,
            ..DeviceState::default()
        });

        assert_eq!(fx.scheduler.start_prefetching("u-1"), 1);
        let queued = fx.scheduler.queued_tasks();
        assert_eq!(queued[0].kind, PrefetchKind::Notification);
        assert_eq!(queued[0].priority, Priority::High);
    }

    #[test]
    fn cached_assets_wait_for_wifi() {
        let fx = fixture();
        let weak: Weak<dyn AssetPrefetcher> =
            Arc::downgrade(&fx.scheduler) as Weak<dyn AssetPrefetcher>;
        fx.cache.set_asset_prefetcher(weak);
        fx.cache.cache(
            "messages",
            "conv-1",
            json!([{"id": "m-1", "image_url": "https://cdn.example/m-1.png"}]),
            None,
        );
        assert_eq!(fx.scheduler.asset_backlog().len(), 1);

        fx.scheduler.set_device_state(DeviceState {
            network: NetworkType::Cellular,
            ..DeviceState::default()
        });
        assert_eq!(fx.scheduler.start_prefetching("u-1"), 0);
        assert_eq!(fx.scheduler.asset_backlog().len(), 1);

        fx.scheduler.set_device_state(DeviceState::default());
        assert_eq!(fx.scheduler.replan(), 1);
        assert!(fx.scheduler.asset_backlog().is_empty());
        assert!(matches!(
            fx.scheduler.queued_tasks()[0].target,
            PrefetchTarget::Asset { .. }
        ));
    }

    #[test]
    fn profile_is_persisted_and_reloaded() {
        let fx = fixture();
        fx.scheduler
            .update_user_behavior("u-1", &write(Table::Tasks, "t-1"));
        assert!(fx.store.get("behavior:u-1").unwrap().is_some());

        let restarted = PrefetchScheduler::new(
            PrefetchConfig::default(),
            fx.clock.clone() as Arc<dyn Clock>,
            fx.store.clone() as Arc<dyn KeyValueStore>,
            Arc::clone(&fx.cache),
            Arc::new(MockFetcher::new()),
        );
        assert_eq!(restarted.start_prefetching("u-1"), 1);
        assert_eq!(
            restarted.profile("u-1").unwrap().entity_access["tasks:t-1"],
            3
        );
    }
}
