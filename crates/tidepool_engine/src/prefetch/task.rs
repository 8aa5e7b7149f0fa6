//! Prefetch tasks and their queue.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tidepool_protocol::{Priority, Table};

/// Strategy that produced a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchKind {
    /// Frequently accessed rows.
    FrequentItem,
    /// Topics the user follows closely.
    TopicAffinity,
    /// Media referenced by cached collections.
    Asset,
    /// Targets of recently opened notifications.
    Notification,
    /// Results of likely searches.
    SearchPrediction,
}

impl PrefetchKind {
    /// Returns the log name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PrefetchKind::FrequentItem => "frequent_item",
            PrefetchKind::TopicAffinity => "topic_affinity",
            PrefetchKind::Asset => "asset",
            PrefetchKind::Notification => "notification",
            PrefetchKind::SearchPrediction => "search_prediction",
        }
    }
}

/// What a task fetches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrefetchTarget {
    /// One row.
    Entity {
        /// Table of the row.
        table: Table,
        /// Primary key.
        id: String,
    },
    /// Recent rows of a topic.
    Topic {
        /// Topic name.
        topic: String,
    },
    /// A media asset.
    Asset {
        /// Asset URL.
        url: String,
    },
    /// Results of a search.
    Search {
        /// Search text.
        term: String,
    },
}

impl PrefetchTarget {
    /// Cache domain and key the fetched value is stored under.
    pub fn cache_slot(&self) -> (&str, &str) {
        match self {
            PrefetchTarget::Entity { table, id } => (table.as_str(), id.as_str()),
            PrefetchTarget::Topic { topic } => ("topics", topic.as_str()),
            PrefetchTarget::Asset { url } => ("assets", url.as_str()),
            PrefetchTarget::Search { term } => ("search", term.as_str()),
        }
    }
}

/// A unit of speculative work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefetchTask {
    /// Unique task id.
    pub id: String,
    /// Producing strategy.
    pub kind: PrefetchKind,
    /// Priority tier.
    pub priority: Priority,
    /// What to fetch.
    pub target: PrefetchTarget,
    /// Creation time, reset on every re-enqueue.
    pub created_at: i64,
    /// Time after which the task is skipped.
    pub expires_at: i64,
    /// Failed executions so far.
    pub attempts: u32,
}

impl PrefetchTask {
    /// Creates a task expiring `lifetime_ms` after `now`.
    pub fn new(
        kind: PrefetchKind,
        priority: Priority,
        target: PrefetchTarget,
        now: i64,
        lifetime_ms: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            priority,
            target,
            created_at: now,
            expires_at: now.saturating_add(lifetime_ms),
            attempts: 0,
        }
    }

    /// Returns true once the task may no longer run.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Restarts the lifetime after a failed attempt.
    pub fn reset(&mut self, now: i64, lifetime_ms: i64) {
        self.created_at = now;
        self.expires_at = now.saturating_add(lifetime_ms);
    }
}

/// Result of [`TaskQueue::push`].
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    /// Added to the queue.
    Added,
    /// A task for the same target is already queued.
    Duplicate,
    /// Added after evicting the returned lower-ranked task.
    Evicted(PrefetchTask),
    /// Queue full of higher-ranked work; the task was refused.
    Rejected,
}

type QueueKey = (Priority, i64, u64);

/// Prefetch tasks ordered by priority tier, then creation time.
///
/// One task per target. When full, the lowest-ranked task makes room.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    tasks: BTreeMap<QueueKey, PrefetchTask>,
    cap: usize,
    seq: u64,
}

impl TaskQueue {
    /// Creates a queue holding at most `cap` tasks.
    pub fn new(cap: usize) -> Self {
        Self {
            tasks: BTreeMap::new(),
            cap: cap.max(1),
            seq: 0,
        }
    }

    /// Adds a task.
    pub fn push(&mut self, task: PrefetchTask) -> Enqueued {
        if self.tasks.values().any(|queued| queued.target == task.target) {
            return Enqueued::Duplicate;
        }
        self.seq += 1;
        let key = (task.priority, task.created_at, self.seq);

        let mut evicted = None;
        if self.tasks.len() >= self.cap {
            match self.tasks.last_key_value() {
                Some((last, _)) if *last > key => {
                    let last = *last;
                    evicted = self.tasks.remove(&last);
                }
                _ => return Enqueued::Rejected,
            }
        }
        self.tasks.insert(key, task);
        match evicted {
            Some(task) => Enqueued::Evicted(task),
            None => Enqueued::Added,
        }
    }

    /// Removes and returns the highest-ranked task.
    pub fn pop_next(&mut self) -> Option<PrefetchTask> {
        self.tasks.pop_first().map(|(_, task)| task)
    }

    /// Drops every task expired at `now`. Returns how many were dropped.
    pub fn prune_expired(&mut self, now: i64) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| !task.is_expired(now));
        before - self.tasks.len()
    }

    /// Returns the queued tasks in execution order.
    pub fn snapshot(&self) -> Vec<PrefetchTask> {
        self.tasks.values().cloned().collect()
    }

    /// Returns the number of queued tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns the queue fill in percent.
    pub fn utilization_pct(&self) -> f64 {
        self.tasks.len() as f64 * 100.0 / self.cap as f64
    }

    /// Removes every task.
    pub fn clear(&mut self) {
        self.tasks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(priority: Priority, topic: &str, now: i64) -> PrefetchTask {
        PrefetchTask::new(
            PrefetchKind::TopicAffinity,
            priority,
            PrefetchTarget::Topic {
                topic: topic.into(),
            },
            now,
            1_000,
        )
    }

    #[test]
    fn pops_by_priority_then_age() {
        let mut queue = TaskQueue::new(10);
        queue.push(task(Priority::Low, "a", 1));
        queue.push(task(Priority::High, "b", 3));
        queue.push(task(Priority::High, "c", 2));
        queue.push(task(Priority::Normal, "d", 0));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop_next())
            .map(|t| t.target.cache_slot().1.to_string())
            .collect();
        assert_eq!(order, vec!["c", "b", "d", "a"]);
    }

    #[test]
    fn deduplicates_targets() {
        let mut queue = TaskQueue::new(10);
        assert_eq!(queue.push(task(Priority::Normal, "a", 0)), Enqueued::Added);
        assert_eq!(queue.push(task(Priority::High, "a", 1)), Enqueued::Duplicate);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn full_queue_evicts_lowest_rank() {
        let mut queue = TaskQueue::new(2);
        queue.push(task(Priority::Normal, "a", 0));
        queue.push(task(Priority::Low, "b", 0));

        match queue.push(task(Priority::High, "c", 5)) {
            Enqueued::Evicted(evicted) => assert_eq!(evicted.priority, Priority::Low),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(queue.push(task(Priority::Low, "d", 9)), Enqueued::Rejected);
        assert_eq!(queue.len(), 2);
        assert!((queue.utilization_pct() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn prunes_expired_tasks() {
        let mut queue = TaskQueue::new(10);
        queue.push(task(Priority::Normal, "old", 0));
        queue.push(task(Priority::Normal, "new", 900));
        assert_eq!(queue.prune_expired(1_000), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn reset_extends_lifetime() {
        let mut t = task(Priority::Normal, "a", 0);
        assert!(t.is_expired(1_000));
        t.reset(1_000, 1_000);
        assert!(!t.is_expired(1_500));
        assert_eq!(t.created_at, 1_000);
    }
}
