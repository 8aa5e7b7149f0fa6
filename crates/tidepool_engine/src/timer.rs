//! Scheduled tasks.
//!
//! A [`ScheduledTask`] owns at most one pending timer and moves through
//! `Idle -> Scheduled -> Firing -> Idle`. Debounce, retry and batch
//! windows are all built on it.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// State of a [`ScheduledTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// No timer pending.
    Idle,
    /// A timer is pending.
    Scheduled,
    /// The action is running.
    Firing,
}

#[derive(Debug)]
struct TaskInner {
    state: TaskState,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// A single-slot timer.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    name: &'static str,
    inner: Arc<Mutex<TaskInner>>,
}

impl ScheduledTask {
    /// Creates an idle task.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(TaskInner {
                state: TaskState::Idle,
                generation: 0,
                handle: None,
            })),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    /// Schedules `action` after `delay`, replacing any pending timer.
    ///
    /// A running action is never interrupted. Returns false if called
    /// outside a tokio runtime.
    pub fn schedule<F, Fut>(&self, delay: Duration, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.arm(delay, action, true)
    }

    /// Schedules `action` after `delay` unless a timer is already pending.
    ///
    /// Returns true if a new timer was armed.
    pub fn schedule_if_idle<F, Fut>(&self, delay: Duration, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.arm(delay, action, false)
    }

    /// Cancels a pending timer. Returns true if one was pending.
    pub fn cancel(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TaskState::Scheduled {
            return false;
        }
        if let Some(handle) = inner.handle.take() {
            handle.abort();
        }
        inner.generation += 1;
        inner.state = TaskState::Idle;
        true
    }

    fn arm<F, Fut>(&self, delay: Duration, action: F, replace: bool) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(task = self.name, "no runtime; timer not armed");
            return false;
        };

        let mut inner = self.inner.lock();
        if inner.state == TaskState::Scheduled {
            if !replace {
                return false;
            }
            if let Some(handle) = inner.handle.take() {
                handle.abort();
            }
        }

        inner.generation += 1;
        inner.state = TaskState::Scheduled;
        let generation = inner.generation;
        let shared = Arc::downgrade(&self.inner);
        let name = self.name;

        inner.handle = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            {
                let mut guard = shared.lock();
                if guard.generation != generation {
                    return;
                }
                guard.state = TaskState::Firing;
            }
            debug!(task = name, "timer fired");
            action().await;
            let mut guard = shared.lock();
            if guard.generation == generation {
                guard.state = TaskState::Idle;
                guard.handle = None;
            }
        }));
        true
    }
}

// Dropping the last handle cancels a pending timer.
impl Drop for TaskInner {
    fn drop(&mut self) {
        if self.state == TaskState::Scheduled {
            if let Some(handle) = self.handle.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let task = ScheduledTask::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        assert!(task.schedule(Duration::from_millis(500), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(task.state(), TaskState::Scheduled);

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_coalesces_bursts() {
        let task = ScheduledTask::new("debounce");
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = Arc::clone(&hits);
            task.schedule(Duration::from_millis(100), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_if_idle_keeps_first_deadline() {
        let task = ScheduledTask::new("window");
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        assert!(task.schedule_if_idle(Duration::from_millis(100), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(60)).await;
        let counter = Arc::clone(&hits);
        assert!(!task.schedule_if_idle(Duration::from_millis(100), move || async move {
            counter.fetch_add(10, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let task = ScheduledTask::new("cancel");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        task.schedule(Duration::from_secs(1), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(task.cancel());
        assert!(!task.cancel());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_runtime_is_not_fatal() {
        let task = ScheduledTask::new("orphan");
        assert!(!task.schedule(Duration::from_secs(1), || async {}));
        assert_eq!(task.state(), TaskState::Idle);
    }
}
