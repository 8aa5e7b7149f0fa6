//! Status streams.
//!
//! [`Observable`] holds the latest value of a status object and fans every
//! update out to its subscribers synchronously. Writes and their
//! notifications are serialized, so every subscriber sees values in write
//! order. New subscribers receive the current value immediately. [`EventFeed`] distributes discrete events
//! (such as cache invalidations) over channels and keeps a bounded history.

use parking_lot::{ReentrantMutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    value: RwLock<T>,
    subscribers: RwLock<Vec<(u64, Callback<T>)>>,
    next_id: AtomicU64,
    // Held across a write and its fan-out. Reentrant so callbacks may write.
    publish: ReentrantMutex<()>,
}

/// A value that notifies subscribers whenever it changes.
///
/// Cloning an `Observable` yields another handle to the same value.
pub struct Observable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    /// Creates an observable holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: RwLock::new(initial),
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                publish: ReentrantMutex::new(()),
            }),
        }
    }

    /// Returns a copy of the current value.
    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Replaces the value and notifies subscribers.
    pub fn set(&self, value: T) {
        let _publish = self.inner.publish.lock();
        *self.inner.value.write() = value.clone();
        self.notify(&value);
    }

    /// Mutates the value in place and notifies subscribers.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let _publish = self.inner.publish.lock();
        let value = {
            let mut guard = self.inner.value.write();
            f(&mut guard);
            guard.clone()
        };
        self.notify(&value);
    }

    /// Registers a callback.
    ///
    /// The callback runs immediately with the current value, then on every
    /// update until the returned [`Subscription`] is dropped.
    #[must_use = "dropping the subscription unsubscribes"]
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback<T> = Arc::new(callback);
        let publish = self.inner.publish.lock();
        self.inner
            .subscribers
            .write()
            .push((id, Arc::clone(&callback)));

        let current = self.get();
        callback(&current);
        drop(publish);

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.subscribers.write().retain(|(sid, _)| *sid != id);
                }
            })),
        }
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    fn notify(&self, value: &T) {
        // Callbacks run without the subscriber lock so they may subscribe.
        let callbacks: Vec<Callback<T>> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(value);
        }
    }
}

impl<T: Clone + Send + Sync + Default + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("value", &*self.inner.value.read())
            .field("subscribers", &self.inner.subscribers.read().len())
            .finish()
    }
}

/// Keeps an [`Observable`] callback registered until dropped.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unsubscribes now.
    pub fn cancel(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// A feed that distributes events to channel subscribers.
///
/// The feed:
/// - Preserves emit order
/// - Supports multiple subscribers
/// - Drops disconnected subscribers on the next emit
/// - Keeps the most recent events for polling
pub struct EventFeed<T> {
    subscribers: RwLock<Vec<Sender<T>>>,
    history: RwLock<Vec<T>>,
    max_history: usize,
}

impl<T: Clone> EventFeed<T> {
    /// Creates a feed with a specific history limit.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
        }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits an event to all subscribers.
    pub fn emit(&self, event: T) {
        {
            let mut history = self.history.write();
            history.push(event.clone());
            if history.len() > self.max_history {
                let to_remove = history.len() - self.max_history;
                history.drain(0..to_remove);
            }
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns up to `limit` of the most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<T> {
        let history = self.history.read();
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl<T: Clone> Default for EventFeed<T> {
    fn default() -> Self {
        Self::with_max_history(1_000)
    }
}

impl<T> std::fmt::Debug for EventFeed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFeed")
            .field("subscribers", &self.subscribers.read().len())
            .field("max_history", &self.max_history)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn replays_current_value_on_subscribe() {
        let observable = Observable::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = observable.subscribe(move |v| sink.lock().push(*v));

        observable.set(2);
        observable.update(|v| *v += 1);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(observable.get(), 3);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let observable = Observable::new(0);
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        let sub = observable.subscribe(move |_| *sink.lock() += 1);
        assert_eq!(observable.subscriber_count(), 1);

        drop(sub);
        observable.set(5);
        assert_eq!(*seen.lock(), 1);
        assert_eq!(observable.subscriber_count(), 0);
    }

    #[test]
    fn concurrent_updates_notify_in_write_order() {
        let observable = Observable::new(0u64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = observable.subscribe(move |v| sink.lock().push(*v));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let observable = observable.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        observable.update(|v| *v += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 1_601);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last().copied(), Some(observable.get()));
    }

    #[test]
    fn callbacks_may_write_back() {
        let observable = Observable::new(0);
        let inner = observable.clone();
        let _sub = observable.subscribe(move |v| {
            if *v == 1 {
                inner.set(2);
            }
        });
        observable.set(1);
        assert_eq!(observable.get(), 2);
    }

    #[test]
    fn clones_share_state() {
        let a = Observable::new(String::from("idle"));
        let b = a.clone();
        b.set("syncing".into());
        assert_eq!(a.get(), "syncing");
    }

    #[test]
    fn event_feed_fan_out_and_history() {
        let feed = EventFeed::with_max_history(2);
        let rx1 = feed.subscribe();
        let rx2 = feed.subscribe();

        feed.emit(1);
        feed.emit(2);
        feed.emit(3);

        assert_eq!(rx1.try_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(rx2.try_iter().count(), 3);
        assert_eq!(feed.recent(10), vec![2, 3]);
    }

    #[test]
    fn event_feed_drops_disconnected() {
        let feed = EventFeed::default();
        let rx = feed.subscribe();
        drop(rx);
        feed.emit("x");
        assert_eq!(feed.subscriber_count(), 0);
    }
}
