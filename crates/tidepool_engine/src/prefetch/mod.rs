//! Predictive prefetching.
//!
//! [`PrefetchScheduler`] turns a user's [`BehaviorProfile`] and the device
//! conditions into [`PrefetchTask`]s, then fetches and caches them in the
//! background ahead of demand.

mod behavior;
mod fetcher;
mod scheduler;
mod strategy;
mod task;

pub use behavior::{Activity, BehaviorProfile, EntityRef};
pub use fetcher::{MockFetcher, PrefetchFetcher};
pub use scheduler::{PrefetchScheduler, PrefetchStats, BEHAVIOR_PREFIX};
pub use strategy::{
    default_strategies, Assets, DeviceState, FrequentItems, NetworkType, NotificationContext,
    PlannedTask, PrefetchContext, PrefetchStrategy, SearchPrediction, TopicAffinity,
};
pub use task::{Enqueued, PrefetchKind, PrefetchTarget, PrefetchTask, TaskQueue};
