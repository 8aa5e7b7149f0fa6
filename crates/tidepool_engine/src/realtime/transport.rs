//! Realtime transport abstraction.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tidepool_protocol::{ChannelFilter, OutboundPayload};

/// Connectivity to the realtime service.
///
/// Inbound events are delivered by the transport implementation through
/// [`RealtimeChannelManager::dispatch`](super::RealtimeChannelManager::dispatch).
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Opens the channel for `topic`.
    async fn connect(&self, topic: &str, filter: &ChannelFilter) -> EngineResult<()>;

    /// Sends a payload on an open channel.
    async fn send(&self, topic: &str, payload: &OutboundPayload) -> EngineResult<()>;

    /// Closes the channel for `topic`.
    async fn disconnect(&self, topic: &str) -> EngineResult<()>;

    /// Lightweight reachability probe.
    async fn heartbeat(&self) -> EngineResult<()>;
}

/// A transport for testing.
///
/// Records every sent payload. Connect failures can be injected by count,
/// and the whole service can be made unreachable.
#[derive(Debug)]
pub struct MockChannelTransport {
    available: AtomicBool,
    connect_failures: AtomicU32,
    connect_calls: AtomicUsize,
    heartbeat_calls: AtomicUsize,
    sent: Mutex<Vec<(String, OutboundPayload)>>,
    disconnected: Mutex<Vec<String>>,
}

impl MockChannelTransport {
    /// Creates a reachable transport.
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            connect_failures: AtomicU32::new(0),
            connect_calls: AtomicUsize::new(0),
            heartbeat_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
        }
    }

    /// Makes the next `count` connects fail.
    pub fn fail_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Makes every operation fail while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns every payload sent so far.
    pub fn sent(&self) -> Vec<(String, OutboundPayload)> {
        self.sent.lock().clone()
    }

    /// Returns the number of messages sent on `topic`, counting batched
    /// messages individually.
    pub fn messages_sent(&self, topic: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.message_count())
            .sum()
    }

    /// Returns the number of connect calls.
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Returns the number of heartbeat probes.
    pub fn heartbeat_calls(&self) -> usize {
        self.heartbeat_calls.load(Ordering::SeqCst)
    }

    /// Returns the topics disconnected so far.
    pub fn disconnected(&self) -> Vec<String> {
        self.disconnected.lock().clone()
    }

    fn check_available(&self) -> EngineResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::NotConnected)
        }
    }
}

impl Default for MockChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelTransport for MockChannelTransport {
    async fn connect(&self, _topic: &str, _filter: &ChannelFilter) -> EngineResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let failed = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EngineError::transport_retryable("simulated connect failure"));
        }
        Ok(())
    }

    async fn send(&self, topic: &str, payload: &OutboundPayload) -> EngineResult<()> {
        self.check_available()?;
        self.sent.lock().push((topic.to_string(), payload.clone()));
        Ok(())
    }

    async fn disconnect(&self, topic: &str) -> EngineResult<()> {
        self.disconnected.lock().push(topic.to_string());
        Ok(())
    }

    async fn heartbeat(&self) -> EngineResult<()> {
        self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()
    }
}
