//! Realtime channel manager.
//!
//! One logical channel per topic. Each channel owns a token bucket, a batch
//! buffer and a bounded outbox:
//!
//! - sends within the rate limit go out directly
//! - over-limit sends are batched and flushed on size or timeout
//! - sends on a disconnected channel wait in the outbox and are replayed
//!   in order after reconnecting
//!
//! Connection failures back off exponentially with jitter. Once the retry
//! budget is spent the channel goes offline and probes the transport with
//! heartbeats until it answers.

use super::channel::{ChannelCallbacks, ChannelEntry, ChannelState, SubscriptionHandle};
use super::transport::ChannelTransport;
use crate::cache::{InvalidationReason, TieredCacheManager};
use crate::clock::{duration_millis, Clock};
use crate::config::RealtimeConfig;
use crate::error::{EngineError, EngineResult};
use crate::observable::Observable;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tidepool_protocol::timestamp::millis_to_canonical;
use tidepool_protocol::{
    BroadcastEnvelope, ChannelEvent, ChannelFilter, OutboundPayload, PresenceEnvelope,
};
use tracing::{debug, info, warn};

/// How a send was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Sent immediately.
    Sent,
    /// Held in the batch buffer, or flushed as part of a batch.
    Batched,
    /// Held in the outbox until the channel reconnects.
    Queued,
}

/// Live channel counts for monitors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RealtimeMetrics {
    /// Channels currently open.
    pub active_channels: usize,
    /// Subscribed channels in any state.
    pub total_channels: usize,
    /// Channels that exhausted their retries.
    pub offline_channels: usize,
    /// Messages waiting in batch buffers and outboxes.
    pub queued_messages: usize,
    /// Topics whose token bucket is empty.
    pub rate_limited_topics: usize,
    /// Reconnect attempts since startup.
    pub retry_count: u64,
    /// Outbox fill across all channels.
    pub queue_utilization_pct: f64,
    /// Channel pool fill.
    pub pool_utilization_pct: f64,
}

fn percent(used: usize, capacity: usize) -> f64 {
    if capacity == 0 {
        0.0
    } else {
        used as f64 * 100.0 / capacity as f64
    }
}

enum SendPlan {
    Direct(OutboundPayload),
    Flush(OutboundPayload),
    Batched,
    Queued,
}

/// Owns every realtime channel of the client.
pub struct RealtimeChannelManager {
    me: Weak<Self>,
    config: RealtimeConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn ChannelTransport>,
    cache: Option<Arc<TieredCacheManager>>,
    channels: Mutex<HashMap<String, ChannelEntry>>,
    next_id: AtomicU64,
    retries: AtomicU64,
    status: Observable<RealtimeMetrics>,
}

impl RealtimeChannelManager {
    /// Creates a manager.
    ///
    /// Row changes delivered to subscribers invalidate the matching cache
    /// domain when `cache` is set.
    pub fn new(
        config: RealtimeConfig,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn ChannelTransport>,
        cache: Option<Arc<TieredCacheManager>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            clock,
            transport,
            cache,
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            retries: AtomicU64::new(0),
            status: Observable::default(),
        })
    }

    /// Subscribes to `topic`, replacing any existing subscription.
    ///
    /// The first connect runs inline; a failure does not fail the call but
    /// moves the channel into backoff. When the pool is full the oldest
    /// channel is evicted.
    pub async fn subscribe(
        &self,
        topic: &str,
        filter: ChannelFilter,
        callbacks: ChannelCallbacks,
    ) -> EngineResult<SubscriptionHandle> {
        if topic.trim().is_empty() {
            return Err(EngineError::Configuration("empty channel topic".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_millis();

        let (replaced, evicted) = {
            let mut channels = self.channels.lock();
            let replaced = match channels.remove(topic) {
                Some(old) => {
                    old.cancel_timers();
                    true
                }
                None => false,
            };
            let mut evicted = None;
            if channels.len() >= self.config.pool_cap {
                let oldest = channels
                    .iter()
                    .min_by_key(|(_, entry)| entry.id)
                    .map(|(name, _)| name.clone());
                if let Some(entry) = oldest.as_ref().and_then(|name| channels.remove(name)) {
                    entry.cancel_timers();
                    warn!(
                        topic = oldest.as_deref().unwrap_or_default(),
                        pool_cap = self.config.pool_cap,
                        dropped = entry.queued_messages(),
                        "channel pool full; evicted oldest channel"
                    );
                    evicted = oldest.map(|name| (name, entry.callbacks.on_status.clone()));
                }
            }
            channels.insert(
                topic.to_string(),
                ChannelEntry::new(id, filter, callbacks, &self.config, now),
            );
            (replaced, evicted)
        };

        if replaced {
            debug!(topic, "replacing existing subscription");
            self.close_transport(topic).await;
        }
        if let Some((name, on_status)) = evicted {
            self.close_transport(&name).await;
            if let Some(callback) = on_status {
                callback(ChannelState::Closed);
            }
        }

        self.connect(topic, id).await;
        self.publish();
        Ok(SubscriptionHandle {
            topic: topic.to_string(),
            id,
        })
    }

    /// Tears down the channel for `topic`.
    ///
    /// Cancels its timers and flushes a pending batch if the channel is
    /// open. Queued sends of a disconnected channel are discarded. Returns
    /// false if nothing was subscribed.
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let now = self.clock.now_millis();
        let (pending, on_status) = {
            let mut channels = self.channels.lock();
            let Some(mut entry) = channels.remove(topic) else {
                return false;
            };
            entry.cancel_timers();
            let pending = if entry.state == ChannelState::Open {
                entry
                    .batch
                    .take(millis_to_canonical(now))
                    .map(OutboundPayload::Batch)
            } else {
                None
            };
            if !entry.outbox.is_empty() {
                warn!(
                    topic,
                    dropped = entry.outbox.len(),
                    "discarding queued sends of closed channel"
                );
            }
            (pending, entry.callbacks.on_status.clone())
        };

        if let Some(payload) = pending {
            if let Err(e) = self.transport.send(topic, &payload).await {
                warn!(topic, error = %e, "final batch flush failed");
            }
        }
        self.close_transport(topic).await;
        if let Some(callback) = on_status {
            callback(ChannelState::Closed);
        }
        info!(topic, "unsubscribed");
        self.publish();
        true
    }

    /// Reconnects every channel in backoff or offline now.
    ///
    /// Returns the number of channels retried.
    pub async fn reconnect_all(&self) -> usize {
        let targets: Vec<(String, u64)> = {
            let mut channels = self.channels.lock();
            channels
                .iter_mut()
                .filter(|(_, entry)| {
                    matches!(entry.state, ChannelState::Backoff | ChannelState::Offline)
                })
                .map(|(topic, entry)| {
                    entry.reconnect_timer.cancel();
                    entry.heartbeat_timer.cancel();
                    entry.backoff.reset();
                    (topic.clone(), entry.id)
                })
                .collect()
        };
        for (topic, id) in &targets {
            self.connect(topic, *id).await;
        }
        self.publish();
        targets.len()
    }

    /// Sends a broadcast on `topic`.
    ///
    /// Never drops a message: over-limit sends are batched and sends on a
    /// disconnected channel are queued. Fails only if the topic has no
    /// subscription.
    pub async fn send(&self, topic: &str, message: BroadcastEnvelope) -> EngineResult<SendOutcome> {
        let now = self.clock.now_millis();
        let (id, plan) = {
            let mut channels = self.channels.lock();
            let entry = channels
                .get_mut(topic)
                .ok_or_else(|| EngineError::UnknownChannel(topic.to_string()))?;
            let plan = if entry.state.is_disconnected() {
                if let Some(evicted) = entry.outbox.push(OutboundPayload::Broadcast(message)) {
                    warn!(
                        topic,
                        dropped = evicted.message_count(),
                        "outbound queue full; evicted oldest"
                    );
                }
                SendPlan::Queued
            } else if entry.limiter.try_acquire(now) {
                SendPlan::Direct(OutboundPayload::Broadcast(message))
            } else if entry.batch.push(message) {
                entry.batch_timer.cancel();
                match entry.batch.take(millis_to_canonical(now)) {
                    Some(batch) => SendPlan::Flush(OutboundPayload::Batch(batch)),
                    None => SendPlan::Batched,
                }
            } else {
                let me = self.me.clone();
                let name = topic.to_string();
                let id = entry.id;
                entry
                    .batch_timer
                    .schedule_if_idle(self.config.batch_timeout, move || {
                        Self::flush_later(me, name, id)
                    });
                SendPlan::Batched
            };
            (entry.id, plan)
        };

        let outcome = match plan {
            SendPlan::Direct(payload) => {
                if self.deliver(topic, id, payload).await {
                    SendOutcome::Sent
                } else {
                    SendOutcome::Queued
                }
            }
            SendPlan::Flush(payload) => {
                debug!(topic, "batch full; flushing");
                self.deliver(topic, id, payload).await;
                SendOutcome::Batched
            }
            SendPlan::Batched => SendOutcome::Batched,
            SendPlan::Queued => SendOutcome::Queued,
        };
        self.publish();
        Ok(outcome)
    }

    /// Delivers an inbound event to the subscriber of `topic`.
    ///
    /// Row changes that fail the channel filter are dropped. Returns true
    /// if the event was delivered.
    pub fn dispatch(&self, topic: &str, event: ChannelEvent) -> bool {
        let callbacks = {
            let mut channels = self.channels.lock();
            let Some(entry) = channels.get_mut(topic) else {
                debug!(topic, "event for unknown channel");
                return false;
            };
            match &event {
                ChannelEvent::RowChange(change) if !entry.filter.matches(change) => return false,
                ChannelEvent::Presence(presence) => entry.apply_presence(presence),
                _ => {}
            }
            entry.callbacks.clone()
        };

        match &event {
            ChannelEvent::RowChange(change) => {
                if let Some(cache) = &self.cache {
                    cache.invalidate_domain(change.table.as_str(), InvalidationReason::Remote);
                }
                if let Some(callback) = &callbacks.on_row_change {
                    callback(change);
                }
            }
            ChannelEvent::Broadcast(message) => {
                if let Some(callback) = &callbacks.on_broadcast {
                    callback(message);
                }
            }
            ChannelEvent::Presence(presence) => {
                if let Some(callback) = &callbacks.on_presence {
                    callback(presence);
                }
            }
        }
        true
    }

    /// Returns the presence roster of `topic`, ordered by user id.
    pub fn presence(&self, topic: &str) -> Vec<PresenceEnvelope> {
        let channels = self.channels.lock();
        let mut roster: Vec<PresenceEnvelope> = channels
            .get(topic)
            .map(|entry| entry.roster.values().cloned().collect())
            .unwrap_or_default();
        roster.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        roster
    }

    /// Returns the state of the channel for `topic`.
    pub fn channel_state(&self, topic: &str) -> Option<ChannelState> {
        self.channels.lock().get(topic).map(|entry| entry.state)
    }

    /// Returns every subscribed topic, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.channels.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Computes the current metrics.
    pub fn metrics(&self) -> RealtimeMetrics {
        let now = self.clock.now_millis();
        let channels = self.channels.lock();
        let total = channels.len();
        let outboxed: usize = channels.values().map(|entry| entry.outbox.len()).sum();
        RealtimeMetrics {
            active_channels: channels
                .values()
                .filter(|entry| entry.state == ChannelState::Open)
                .count(),
            total_channels: total,
            offline_channels: channels
                .values()
                .filter(|entry| entry.state == ChannelState::Offline)
                .count(),
            queued_messages: channels.values().map(ChannelEntry::queued_messages).sum(),
            rate_limited_topics: channels
                .values()
                .filter(|entry| entry.limiter.is_limited(now))
                .count(),
            retry_count: self.retries.load(Ordering::Relaxed),
            queue_utilization_pct: percent(outboxed, self.config.queue_cap * total),
            pool_utilization_pct: percent(total, self.config.pool_cap),
        }
    }

    /// Returns the metrics stream.
    pub fn status(&self) -> &Observable<RealtimeMetrics> {
        &self.status
    }

    fn publish(&self) {
        self.status.set(self.metrics());
    }

    async fn connect(&self, topic: &str, id: u64) {
        let filter = {
            let mut channels = self.channels.lock();
            match channels.get_mut(topic) {
                Some(entry) if entry.id == id => entry.filter.clone(),
                _ => return,
            }
        };
        match self.transport.connect(topic, &filter).await {
            Ok(()) => self.on_connected(topic, id).await,
            Err(e) => self.handle_failure(topic, id, &e.to_string()),
        }
    }

    async fn on_connected(&self, topic: &str, id: u64) {
        let (replay, on_status) = {
            let mut channels = self.channels.lock();
            let Some(entry) = channels.get_mut(topic).filter(|entry| entry.id == id) else {
                return;
            };
            entry.state = ChannelState::Open;
            entry.backoff.reset();
            entry.heartbeat_timer.cancel();
            (entry.outbox.drain(), entry.callbacks.on_status.clone())
        };
        info!(topic, replay = replay.len(), "channel open");
        if let Some(callback) = on_status {
            callback(ChannelState::Open);
        }

        let mut remaining = replay.into_iter();
        while let Some(payload) = remaining.next() {
            if let Err(e) = self.transport.send(topic, &payload).await {
                let mut unsent = vec![payload];
                unsent.extend(remaining);
                self.requeue(topic, id, unsent);
                self.handle_failure(topic, id, &e.to_string());
                break;
            }
        }
        self.publish();
    }

    /// Sends one payload; on failure queues it and starts reconnecting.
    async fn deliver(&self, topic: &str, id: u64, payload: OutboundPayload) -> bool {
        match self.transport.send(topic, &payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(topic, error = %e, "send failed; queued for replay");
                self.requeue(topic, id, vec![payload]);
                self.handle_failure(topic, id, &e.to_string());
                false
            }
        }
    }

    fn requeue(&self, topic: &str, id: u64, payloads: Vec<OutboundPayload>) {
        let mut channels = self.channels.lock();
        let Some(entry) = channels.get_mut(topic).filter(|entry| entry.id == id) else {
            return;
        };
        let expected = entry.outbox.len() + payloads.len();
        entry.outbox.requeue_front(payloads);
        let dropped = expected - entry.outbox.len();
        if dropped > 0 {
            warn!(topic, dropped, "outbound queue full; evicted oldest");
        }
    }

    fn handle_failure(&self, topic: &str, id: u64, error: &str) {
        let (state, on_status) = {
            let mut channels = self.channels.lock();
            let Some(entry) = channels.get_mut(topic).filter(|entry| entry.id == id) else {
                return;
            };
            let delay = entry.backoff.record_failure();
            self.retries.fetch_add(1, Ordering::Relaxed);
            let me = self.me.clone();
            let name = topic.to_string();

            if entry.backoff.is_exhausted() {
                entry.state = ChannelState::Offline;
                entry.reconnect_timer.cancel();
                entry
                    .heartbeat_timer
                    .schedule(self.config.heartbeat_interval, move || {
                        Self::probe_later(me, name, id)
                    });
                warn!(
                    topic,
                    failures = entry.backoff.failures(),
                    error,
                    "channel offline; probing with heartbeats"
                );
            } else {
                entry.state = ChannelState::Backoff;
                entry
                    .reconnect_timer
                    .schedule(delay, move || Self::reconnect_later(me, name, id));
                debug!(
                    topic,
                    attempt = entry.backoff.failures(),
                    delay_ms = duration_millis(delay),
                    error,
                    "channel failed; reconnecting"
                );
            }
            (entry.state, entry.callbacks.on_status.clone())
        };
        if let Some(callback) = on_status {
            callback(state);
        }
        self.publish();
    }

    fn keep_probing(&self, topic: &str, id: u64, error: &str) {
        let mut channels = self.channels.lock();
        let Some(entry) = channels.get_mut(topic).filter(|entry| entry.id == id) else {
            return;
        };
        if entry.state != ChannelState::Offline {
            return;
        }
        debug!(topic, error, "heartbeat unanswered");
        let me = self.me.clone();
        let name = topic.to_string();
        entry
            .heartbeat_timer
            .schedule(self.config.heartbeat_interval, move || {
                Self::probe_later(me, name, id)
            });
    }

    async fn flush_batch(&self, topic: &str, id: u64) {
        let now = self.clock.now_millis();
        let ready = {
            let mut channels = self.channels.lock();
            let Some(entry) = channels.get_mut(topic).filter(|entry| entry.id == id) else {
                return;
            };
            let Some(batch) = entry.batch.take(millis_to_canonical(now)) else {
                return;
            };
            let payload = OutboundPayload::Batch(batch);
            if entry.state.is_disconnected() {
                if let Some(evicted) = entry.outbox.push(payload) {
                    warn!(
                        topic,
                        dropped = evicted.message_count(),
                        "outbound queue full; evicted oldest"
                    );
                }
                None
            } else {
                Some(payload)
            }
        };
        if let Some(payload) = ready {
            debug!(topic, messages = payload.message_count(), "batch window elapsed; flushing");
            self.deliver(topic, id, payload).await;
        }
        self.publish();
    }

    async fn close_transport(&self, topic: &str) {
        if let Err(e) = self.transport.disconnect(topic).await {
            debug!(topic, error = %e, "disconnect failed");
        }
    }

    // Timer entry points hold only a weak handle so a dropped manager stops
    // its own timers.

    fn reconnect_later(me: Weak<Self>, topic: String, id: u64) -> BoxFuture<'static, ()> {
        async move {
            if let Some(manager) = me.upgrade() {
                manager.connect(&topic, id).await;
            }
        }
        .boxed()
    }

    fn probe_later(me: Weak<Self>, topic: String, id: u64) -> BoxFuture<'static, ()> {
        async move {
            let Some(manager) = me.upgrade() else {
                return;
            };
            match manager.transport.heartbeat().await {
                Ok(()) => {
                    debug!(topic = %topic, "heartbeat answered; reconnecting");
                    manager.connect(&topic, id).await;
                }
                Err(e) => manager.keep_probing(&topic, id, &e.to_string()),
            }
        }
        .boxed()
    }

    fn flush_later(me: Weak<Self>, topic: String, id: u64) -> BoxFuture<'static, ()> {
        async move {
            if let Some(manager) = me.upgrade() {
                manager.flush_batch(&topic, id).await;
            }
        }
        .boxed()
    }
}

impl fmt::Debug for RealtimeChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeChannelManager")
            .field("channels", &self.channels.lock().len())
            .field("retries", &self.retries.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredCacheManager;
    use crate::clock::ManualClock;
    use crate::config::{CacheConfig, CacheDomain, RetryConfig};
    use crate::realtime::MockChannelTransport;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tidepool_protocol::{
        PresenceEvent, PresenceStatus, RowChange, RowChangeKind, RowFilter, Table,
    };
    use tidepool_storage::InMemoryStore;

    struct Fixture {
        clock: Arc<ManualClock>,
        transport: Arc<MockChannelTransport>,
        manager: Arc<RealtimeChannelManager>,
    }

    fn fixture(config: RealtimeConfig) -> Fixture {
        fixture_with_cache(config, None)
    }

    fn fixture_with_cache(
        config: RealtimeConfig,
        cache: Option<Arc<TieredCacheManager>>,
    ) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let transport = Arc::new(MockChannelTransport::new());
        let manager = RealtimeChannelManager::new(
            config,
            clock.clone() as Arc<dyn Clock>,
            transport.clone() as Arc<dyn ChannelTransport>,
            cache,
        );
        Fixture {
            clock,
            transport,
            manager,
        }
    }

    fn message(n: u32) -> BroadcastEnvelope {
        BroadcastEnvelope::new("chat", json!({ "n": n }), "2026-01-01T00:00:00.000Z")
    }

    fn quick_retry() -> RetryConfig {
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn over_limit_send_goes_to_batch() {
        let fx = fixture(RealtimeConfig::default().with_rate_limit(5));
        fx.manager
            .subscribe("room", ChannelFilter::default(), ChannelCallbacks::new())
            .await
            .unwrap();

        for n in 0..5 {
            let outcome = fx.manager.send("room", message(n)).await.unwrap();
            assert_eq!(outcome, SendOutcome::Sent);
        }
        let outcome = fx.manager.send("room", message(5)).await.unwrap();
        assert_eq!(outcome, SendOutcome::Batched);
        assert_eq!(fx.transport.sent().len(), 5);
        assert_eq!(fx.manager.metrics().rate_limited_topics, 1);
        assert_eq!(fx.manager.metrics().queued_messages, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let sent = fx.transport.sent();
        assert_eq!(sent.len(), 6);
        assert!(matches!(&sent[5].1, OutboundPayload::Batch(b) if b.batch_size == 1));
        assert_eq!(fx.transport.messages_sent("room"), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_and_direct_sends_resume_after_refill() {
        let fx = fixture(
            RealtimeConfig::default()
                .with_rate_limit(2)
                .with_batch_size(3),
        );
        fx.manager
            .subscribe("room", ChannelFilter::default(), ChannelCallbacks::new())
            .await
            .unwrap();

        let mut outcomes = Vec::new();
        for n in 0..5 {
            outcomes.push(fx.manager.send("room", message(n)).await.unwrap());
        }
        assert_eq!(
            outcomes,
            vec![
                SendOutcome::Sent,
                SendOutcome::Sent,
                SendOutcome::Batched,
                SendOutcome::Batched,
                SendOutcome::Batched,
            ]
        );
        assert_eq!(fx.transport.messages_sent("room"), 5);

        fx.clock.advance(Duration::from_secs(1));
        let outcome = fx.manager.send("room", message(5)).await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(fx.manager.metrics().queued_messages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_after_retries_then_replays_on_recovery() {
        let fx = fixture(
            RealtimeConfig::default()
                .with_retry(quick_retry())
                .with_queue_cap(5),
        );
        fx.transport.fail_connects(100);
        let states = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        fx.manager
            .subscribe(
                "room",
                ChannelFilter::default(),
                ChannelCallbacks::new().on_status(move |s| sink.lock().push(s)),
            )
            .await
            .unwrap();
        assert_eq!(fx.manager.channel_state("room"), Some(ChannelState::Backoff));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(fx.transport.connect_calls(), 3);
        assert_eq!(fx.manager.channel_state("room"), Some(ChannelState::Offline));
        assert_eq!(fx.manager.metrics().offline_channels, 1);

        let outcome = fx.manager.send("room", message(1)).await.unwrap();
        assert_eq!(outcome, SendOutcome::Queued);
        assert!(fx.transport.sent().is_empty());

        fx.transport.fail_connects(0);
        tokio::time::sleep(fx_heartbeat() + Duration::from_millis(10)).await;
        assert!(fx.transport.heartbeat_calls() >= 1);
        assert_eq!(fx.manager.channel_state("room"), Some(ChannelState::Open));
        assert_eq!(fx.transport.messages_sent("room"), 1);
        assert_eq!(fx.manager.metrics().retry_count, 3);
        assert_eq!(states.lock().last(), Some(&ChannelState::Open));
    }

    fn fx_heartbeat() -> Duration {
        RealtimeConfig::default().heartbeat_interval
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_service_keeps_probing() {
        let fx = fixture(RealtimeConfig::default().with_retry(quick_retry()));
        fx.transport.set_available(false);
        fx.manager
            .subscribe("room", ChannelFilter::default(), ChannelCallbacks::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(350) + fx_heartbeat() * 2).await;
        assert_eq!(fx.manager.channel_state("room"), Some(ChannelState::Offline));
        assert!(fx.transport.heartbeat_calls() >= 2);
        assert_eq!(fx.transport.connect_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn outbox_evicts_oldest_when_full() {
        let fx = fixture(
            RealtimeConfig::default()
                .with_retry(quick_retry())
                .with_queue_cap(2),
        );
        fx.transport.fail_connects(1);
        fx.manager
            .subscribe("room", ChannelFilter::default(), ChannelCallbacks::new())
            .await
            .unwrap();

        for n in 0..3 {
            fx.manager.send("room", message(n)).await.unwrap();
        }
        let metrics = fx.manager.metrics();
        assert_eq!(metrics.queued_messages, 2);
        assert!((metrics.queue_utilization_pct - 100.0).abs() < f64::EPSILON);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let sent = fx.transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0].1, OutboundPayload::Broadcast(m) if m.payload["n"] == 1));
    }

    #[tokio::test]
    async fn pool_cap_evicts_oldest_channel() {
        let fx = fixture(RealtimeConfig::default().with_pool_cap(2));
        for topic in ["a", "b", "c"] {
            fx.manager
                .subscribe(topic, ChannelFilter::default(), ChannelCallbacks::new())
                .await
                .unwrap();
        }
        assert_eq!(fx.manager.topics(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(fx.transport.disconnected(), vec!["a".to_string()]);
        assert!((fx.manager.metrics().pool_utilization_pct - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn resubscribe_replaces_channel() {
        let fx = fixture(RealtimeConfig::default());
        let first = fx
            .manager
            .subscribe("room", ChannelFilter::default(), ChannelCallbacks::new())
            .await
            .unwrap();
        let second = fx
            .manager
            .subscribe("room", ChannelFilter::default(), ChannelCallbacks::new())
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(fx.manager.topics().len(), 1);
        assert_eq!(fx.transport.disconnected(), vec!["room".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_flushes_pending_batch() {
        let fx = fixture(RealtimeConfig::default().with_rate_limit(1));
        fx.manager
            .subscribe("room", ChannelFilter::default(), ChannelCallbacks::new())
            .await
            .unwrap();
        fx.manager.send("room", message(0)).await.unwrap();
        fx.manager.send("room", message(1)).await.unwrap();

        assert!(fx.manager.unsubscribe("room").await);
        assert!(!fx.manager.unsubscribe("room").await);
        let sent = fx.transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[1].1, OutboundPayload::Batch(_)));
        assert!(fx.manager.topics().is_empty());

        let err = fx.manager.send("room", message(2)).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownChannel(_)));
    }

    #[tokio::test]
    async fn dispatch_applies_filter_and_invalidates_cache() {
        let clock = Arc::new(ManualClock::default());
        let cache = Arc::new(TieredCacheManager::new(
            CacheConfig::default()
                .with_domain(CacheDomain::memory("messages", Duration::from_secs(60))),
            clock as Arc<dyn Clock>,
            Arc::new(InMemoryStore::new()),
        ));
        cache.cache("messages", "conv-1", json!([{"id": "m-0"}]), None);

        let fx = fixture_with_cache(RealtimeConfig::default(), Some(Arc::clone(&cache)));
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        fx.manager
            .subscribe(
                "conv-1",
                ChannelFilter::table(Table::Messages)
                    .with_row(RowFilter::eq("conversation_id", "conv-1")),
                ChannelCallbacks::new().on_row_change(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        let change = |conversation: &str| {
            ChannelEvent::RowChange(RowChange {
                table: Table::Messages,
                kind: RowChangeKind::Insert,
                record: Some(json!({"id": "m-1", "conversation_id": conversation})),
                old_record: None,
                commit_timestamp: "2026-01-01T00:00:00.000Z".into(),
            })
        };

        assert!(!fx.manager.dispatch("conv-1", change("conv-2")));
        assert!(cache.get("messages", "conv-1").is_some());

        assert!(fx.manager.dispatch("conv-1", change("conv-1")));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(cache.get("messages", "conv-1").is_none());

        assert!(!fx.manager.dispatch("other", change("conv-1")));
    }

    #[tokio::test]
    async fn presence_roster_tracks_events() {
        let fx = fixture(RealtimeConfig::default());
        fx.manager
            .subscribe("room", ChannelFilter::default(), ChannelCallbacks::new())
            .await
            .unwrap();
        let who = |user: &str| PresenceEnvelope {
            user_id: user.into(),
            status: PresenceStatus::Online,
            last_seen: "2026-01-01T00:00:00.000Z".into(),
            location: None,
            activity: Some("typing".into()),
        };

        fx.manager.dispatch(
            "room",
            ChannelEvent::Presence(PresenceEvent::Join(vec![who("u-2"), who("u-1")])),
        );
        let roster = fx.manager.presence("room");
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].user_id, "u-1");

        fx.manager.dispatch(
            "room",
            ChannelEvent::Presence(PresenceEvent::Leave(vec![who("u-1")])),
        );
        assert_eq!(fx.manager.presence("room").len(), 1);
    }

    #[tokio::test]
    async fn metrics_are_published() {
        let fx = fixture(RealtimeConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&seen);
        let _sub = fx.manager.status().subscribe(move |m| {
            sink.store(m.active_channels, Ordering::SeqCst);
        });
        fx.manager
            .subscribe("room", ChannelFilter::default(), ChannelCallbacks::new())
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
