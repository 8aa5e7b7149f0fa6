//! Per-topic channel state.

use super::backoff::ReconnectBackoff;
use super::batch::BatchBuffer;
use super::limiter::TokenBucket;
use super::outbox::BoundedQueue;
use crate::config::RealtimeConfig;
use crate::timer::ScheduledTask;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tidepool_protocol::{
    BroadcastEnvelope, ChannelFilter, OutboundPayload, PresenceEnvelope, PresenceEvent, RowChange,
};

/// Connection state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// First connect in progress.
    Connecting,
    /// Connected; sends go out directly.
    Open,
    /// Waiting to reconnect after a failure.
    Backoff,
    /// Retries exhausted; probing with heartbeats.
    Offline,
    /// Unsubscribed.
    Closed,
}

impl ChannelState {
    /// Returns true if outbound sends are held back.
    pub fn is_disconnected(&self) -> bool {
        !matches!(self, ChannelState::Open)
    }
}

type RowChangeCallback = Arc<dyn Fn(&RowChange) + Send + Sync>;
type BroadcastCallback = Arc<dyn Fn(&BroadcastEnvelope) + Send + Sync>;
type PresenceCallback = Arc<dyn Fn(&PresenceEvent) + Send + Sync>;
type StatusCallback = Arc<dyn Fn(ChannelState) + Send + Sync>;

/// Callbacks registered with a subscription.
///
/// Callbacks run on the task that delivered the event, without any
/// manager lock held.
#[derive(Clone, Default)]
pub struct ChannelCallbacks {
    pub(crate) on_row_change: Option<RowChangeCallback>,
    pub(crate) on_broadcast: Option<BroadcastCallback>,
    pub(crate) on_presence: Option<PresenceCallback>,
    pub(crate) on_status: Option<StatusCallback>,
}

impl ChannelCallbacks {
    /// Creates an empty callback set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for every row change that passes the filter.
    pub fn on_row_change(mut self, f: impl Fn(&RowChange) + Send + Sync + 'static) -> Self {
        self.on_row_change = Some(Arc::new(f));
        self
    }

    /// Called for every broadcast message.
    pub fn on_broadcast(mut self, f: impl Fn(&BroadcastEnvelope) + Send + Sync + 'static) -> Self {
        self.on_broadcast = Some(Arc::new(f));
        self
    }

    /// Called for every presence event.
    pub fn on_presence(mut self, f: impl Fn(&PresenceEvent) + Send + Sync + 'static) -> Self {
        self.on_presence = Some(Arc::new(f));
        self
    }

    /// Called whenever the channel changes state.
    pub fn on_status(mut self, f: impl Fn(ChannelState) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ChannelCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCallbacks")
            .field("row_change", &self.on_row_change.is_some())
            .field("broadcast", &self.on_broadcast.is_some())
            .field("presence", &self.on_presence.is_some())
            .field("status", &self.on_status.is_some())
            .finish()
    }
}

/// Identifies one subscription.
///
/// Resubscribing to a topic yields a new id; stale handles are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    /// Subscribed topic.
    pub topic: String,
    /// Subscription id.
    pub id: u64,
}

#[derive(Debug)]
pub(crate) struct ChannelEntry {
    pub(crate) id: u64,
    pub(crate) filter: ChannelFilter,
    pub(crate) callbacks: ChannelCallbacks,
    pub(crate) state: ChannelState,
    pub(crate) backoff: ReconnectBackoff,
    pub(crate) limiter: TokenBucket,
    pub(crate) batch: BatchBuffer,
    pub(crate) outbox: BoundedQueue<OutboundPayload>,
    pub(crate) roster: HashMap<String, PresenceEnvelope>,
    pub(crate) reconnect_timer: ScheduledTask,
    pub(crate) batch_timer: ScheduledTask,
    pub(crate) heartbeat_timer: ScheduledTask,
}

impl ChannelEntry {
    pub(crate) fn new(
        id: u64,
        filter: ChannelFilter,
        callbacks: ChannelCallbacks,
        config: &RealtimeConfig,
        now: i64,
    ) -> Self {
        Self {
            id,
            filter,
            callbacks,
            state: ChannelState::Connecting,
            backoff: ReconnectBackoff::new(config.retry.clone()),
            limiter: TokenBucket::new(config.rate_limit_per_sec, now),
            batch: BatchBuffer::new(config.batch_size),
            outbox: BoundedQueue::new(config.queue_cap),
            roster: HashMap::new(),
            reconnect_timer: ScheduledTask::new("realtime-reconnect"),
            batch_timer: ScheduledTask::new("realtime-batch"),
            heartbeat_timer: ScheduledTask::new("realtime-heartbeat"),
        }
    }

    pub(crate) fn cancel_timers(&self) {
        self.reconnect_timer.cancel();
        self.batch_timer.cancel();
        self.heartbeat_timer.cancel();
    }

    /// Messages waiting locally, batched or queued.
    pub(crate) fn queued_messages(&self) -> usize {
        self.batch.len()
            + self
                .outbox
                .iter()
                .map(OutboundPayload::message_count)
                .sum::<usize>()
    }

    pub(crate) fn apply_presence(&mut self, event: &PresenceEvent) {
        match event {
            PresenceEvent::Join(joined) => {
                for presence in joined {
                    self.roster.insert(presence.user_id.clone(), presence.clone());
                }
            }
            PresenceEvent::Sync(roster) => {
                self.roster = roster
                    .iter()
                    .map(|p| (p.user_id.clone(), p.clone()))
                    .collect();
            }
            PresenceEvent::Leave(left) => {
                for presence in left {
                    self.roster.remove(&presence.user_id);
                }
            }
        }
    }
}
