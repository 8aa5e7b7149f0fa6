//! Remote backend abstraction.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tidepool_protocol::{PullRequest, PullResponse, PushRequest, PushResponse, SyncCursor};

/// The backend's sync surface.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, RPC, mock for testing, etc.).
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Pulls changes since the request cursor.
    async fn pull(&self, request: PullRequest) -> EngineResult<PullResponse>;

    /// Pushes a batch of local changes.
    async fn push(&self, request: PushRequest) -> EngineResult<PushResponse>;
}

/// A scripted backend for testing.
///
/// Responses are served from queues; when a queue is empty, pulls return
/// no changes and pushes succeed. Failures and latency can be injected.
#[derive(Debug)]
pub struct MockRemote {
    connected: AtomicBool,
    pull_responses: Mutex<VecDeque<PullResponse>>,
    push_responses: Mutex<VecDeque<PushResponse>>,
    pull_failures: AtomicU32,
    push_failures: AtomicU32,
    delay: Mutex<Duration>,
    pull_requests: Mutex<Vec<PullRequest>>,
    push_requests: Mutex<Vec<PushRequest>>,
    pull_calls: AtomicUsize,
    push_calls: AtomicUsize,
}

impl MockRemote {
    /// Creates a connected mock with empty response queues.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            pull_responses: Mutex::new(VecDeque::new()),
            push_responses: Mutex::new(VecDeque::new()),
            pull_failures: AtomicU32::new(0),
            push_failures: AtomicU32::new(0),
            delay: Mutex::new(Duration::ZERO),
            pull_requests: Mutex::new(Vec::new()),
            push_requests: Mutex::new(Vec::new()),
            pull_calls: AtomicUsize::new(0),
            push_calls: AtomicUsize::new(0),
        }
    }

    /// Queues a pull response.
    pub fn push_pull_response(&self, response: PullResponse) {
        self.pull_responses.lock().push_back(response);
    }

    /// Queues a push response.
    pub fn push_push_response(&self, response: PushResponse) {
        self.push_responses.lock().push_back(response);
    }

    /// Makes the next `count` pulls fail with a retryable error.
    pub fn fail_pulls(&self, count: u32) {
        self.pull_failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` pushes fail with a retryable error.
    pub fn fail_pushes(&self, count: u32) {
        self.push_failures.store(count, Ordering::SeqCst);
    }

    /// Delays every response.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of pull calls received.
    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    /// Number of push calls received.
    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Total calls received.
    pub fn total_calls(&self) -> usize {
        self.pull_calls() + self.push_calls()
    }

    /// Pull requests received, in order.
    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.pull_requests.lock().clone()
    }

    /// Push requests received, in order.
    pub fn push_requests(&self) -> Vec<PushRequest> {
        self.push_requests.lock().clone()
    }

    async fn simulate_latency(&self) {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBackend for MockRemote {
    async fn pull(&self, request: PullRequest) -> EngineResult<PullResponse> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        let cursor = request.last_cursor.unwrap_or(SyncCursor::INITIAL);
        self.pull_requests.lock().push(request);
        self.simulate_latency().await;

        if !self.connected.load(Ordering::SeqCst) {
            return Err(EngineError::NotConnected);
        }
        if Self::take_failure(&self.pull_failures) {
            return Err(EngineError::transport_retryable("simulated pull failure"));
        }

        let queued = self.pull_responses.lock().pop_front();
        Ok(queued.unwrap_or(PullResponse::Changes {
            changes: BTreeMap::new(),
            cursor,
        }))
    }

    async fn push(&self, request: PushRequest) -> EngineResult<PushResponse> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.push_requests.lock().push(request);
        self.simulate_latency().await;

        if !self.connected.load(Ordering::SeqCst) {
            return Err(EngineError::NotConnected);
        }
        if Self::take_failure(&self.push_failures) {
            return Err(EngineError::transport_retryable("simulated push failure"));
        }

        let queued = self.push_responses.lock().pop_front();
        Ok(queued.unwrap_or_else(PushResponse::success))
    }
}
