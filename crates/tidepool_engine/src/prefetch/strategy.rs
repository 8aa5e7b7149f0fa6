//! Prefetch strategies.
//!
//! Strategies run in a fixed order against a [`PrefetchContext`]; each one
//! that applies contributes zero or more planned targets.

use super::behavior::BehaviorProfile;
use super::task::{PrefetchKind, PrefetchTarget};
use crate::config::PrefetchConfig;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tidepool_protocol::Priority;

/// Network the device is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// Unmetered network.
    Wifi,
    /// Metered network.
    Cellular,
    /// No network.
    Offline,
}

/// Device conditions that gate prefetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Current network.
    pub network: NetworkType,
    /// Battery level in percent.
    pub battery_pct: u8,
    /// Whether the device is charging.
    pub charging: bool,
    /// Free storage in megabytes.
    pub free_storage_mb: u64,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            network: NetworkType::Wifi,
            battery_pct: 100,
            charging: false,
            free_storage_mb: u64::MAX,
        }
    }
}

/// Inputs to one planning round.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchContext<'a> {
    /// Device conditions.
    pub device: DeviceState,
    /// Behavior of the user being planned for.
    pub profile: &'a BehaviorProfile,
    /// Asset URLs waiting for an unmetered network.
    pub asset_backlog: &'a [String],
    /// Planning time.
    pub now: DateTime<Utc>,
    /// Scheduler limits.
    pub config: &'a PrefetchConfig,
}

impl PrefetchContext<'_> {
    /// Returns true if the device has any network.
    pub fn is_online(&self) -> bool {
        self.device.network != NetworkType::Offline
    }

    /// Returns true if the battery is low and not charging.
    pub fn is_battery_low(&self) -> bool {
        !self.device.charging && self.device.battery_pct < self.config.min_battery_pct
    }

    /// Returns true if the current hour is a busy hour for the user.
    pub fn is_active_hour(&self) -> bool {
        self.profile.is_active_hour(self.now.hour())
    }
}

/// A target a strategy wants fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTask {
    /// Priority tier.
    pub priority: Priority,
    /// What to fetch.
    pub target: PrefetchTarget,
}

impl PlannedTask {
    fn new(priority: Priority, target: PrefetchTarget) -> Self {
        Self { priority, target }
    }
}

/// Decides what to prefetch under given conditions.
pub trait PrefetchStrategy: Send + Sync {
    /// Kind of the tasks this strategy produces.
    fn kind(&self) -> PrefetchKind;

    /// Returns true if the strategy may run under `ctx`.
    fn applies(&self, ctx: &PrefetchContext<'_>) -> bool;

    /// Plans targets to fetch.
    fn plan(&self, ctx: &PrefetchContext<'_>) -> Vec<PlannedTask>;
}

/// Rows the user opens most.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrequentItems;

impl PrefetchStrategy for FrequentItems {
    fn kind(&self) -> PrefetchKind {
        PrefetchKind::FrequentItem
    }

    fn applies(&self, ctx: &PrefetchContext<'_>) -> bool {
        ctx.is_online() && !ctx.is_battery_low()
    }

    fn plan(&self, ctx: &PrefetchContext<'_>) -> Vec<PlannedTask> {
        let priority = if ctx.is_active_hour() {
            Priority::High
        } else {
            Priority::Normal
        };
        ctx.profile
            .top_entities(ctx.config.frequent_items)
            .into_iter()
            .map(|entity| {
                PlannedTask::new(
                    priority,
                    PrefetchTarget::Entity {
                        table: entity.table,
                        id: entity.id,
                    },
                )
            })
            .collect()
    }
}

/// Topics the user follows.
#[derive(Debug, Default, Clone, Copy)]
pub struct TopicAffinity;

impl PrefetchStrategy for TopicAffinity {
    fn kind(&self) -> PrefetchKind {
        PrefetchKind::TopicAffinity
    }

    fn applies(&self, ctx: &PrefetchContext<'_>) -> bool {
        ctx.is_online() && !ctx.is_battery_low()
    }

    fn plan(&self, ctx: &PrefetchContext<'_>) -> Vec<PlannedTask> {
        ctx.profile
            .top_topics(ctx.config.topics)
            .into_iter()
            .map(|topic| PlannedTask::new(Priority::Normal, PrefetchTarget::Topic { topic }))
            .collect()
    }
}

/// Media from cached collections; unmetered networks only.
#[derive(Debug, Default, Clone, Copy)]
pub struct Assets;

impl PrefetchStrategy for Assets {
    fn kind(&self) -> PrefetchKind {
        PrefetchKind::Asset
    }

    fn applies(&self, ctx: &PrefetchContext<'_>) -> bool {
        ctx.device.network == NetworkType::Wifi
            && !ctx.is_battery_low()
            && ctx.device.free_storage_mb >= ctx.config.min_storage_mb
    }

    fn plan(&self, ctx: &PrefetchContext<'_>) -> Vec<PlannedTask> {
        ctx.asset_backlog
            .iter()
            .map(|url| PlannedTask::new(Priority::Low, PrefetchTarget::Asset { url: url.clone() }))
            .collect()
    }
}

/// Targets of recently opened notifications. Runs on low battery too.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotificationContext;

impl PrefetchStrategy for NotificationContext {
    fn kind(&self) -> PrefetchKind {
        PrefetchKind::Notification
    }

    fn applies(&self, ctx: &PrefetchContext<'_>) -> bool {
        ctx.is_online()
    }

    fn plan(&self, ctx: &PrefetchContext<'_>) -> Vec<PlannedTask> {
        ctx.profile
            .recent_notifications
            .iter()
            .rev()
            .map(|entity| {
                PlannedTask::new(
                    Priority::High,
                    PrefetchTarget::Entity {
                        table: entity.table,
                        id: entity.id.clone(),
                    },
                )
            })
            .collect()
    }
}

/// Results of the user's most frequent searches.
#[derive(Debug, Default, Clone, Copy)]
pub struct SearchPrediction;

impl PrefetchStrategy for SearchPrediction {
    fn kind(&self) -> PrefetchKind {
        PrefetchKind::SearchPrediction
    }

    fn applies(&self, ctx: &PrefetchContext<'_>) -> bool {
        ctx.is_online() && !ctx.is_battery_low()
    }

    fn plan(&self, ctx: &PrefetchContext<'_>) -> Vec<PlannedTask> {
        ctx.profile
            .top_search_terms(ctx.config.search_terms)
            .into_iter()
            .map(|term| PlannedTask::new(Priority::Low, PrefetchTarget::Search { term }))
            .collect()
    }
}

/// The built-in strategies in evaluation order.
pub fn default_strategies() -> Vec<Box<dyn PrefetchStrategy>> {
    vec![
        Box::new(FrequentItems),
        Box::new(TopicAffinity),
        Box::new(Assets),
        Box::new(NotificationContext),
        Box::new(SearchPrediction),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefetch::behavior::{Activity, EntityRef};
    use tidepool_protocol::Table;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-02T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn profile() -> BehaviorProfile {
        let mut profile = BehaviorProfile::new("u-1");
        profile.record(
            &Activity::Write {
                entity: EntityRef::new(Table::Tasks, "t-1"),
                topic: Some("conv-1".into()),
            },
            now(),
        );
        profile.record(
            &Activity::NotificationOpen {
                entity: EntityRef::new(Table::Messages, "m-9"),
            },
            now(),
        );
        profile.record(&Activity::Search { term: "plan".into() }, now());
        profile
    }

    fn kinds(device: DeviceState, backlog: &[String]) -> Vec<PrefetchKind> {
        let profile = profile();
        let config = PrefetchConfig::default();
        let ctx = PrefetchContext {
            device,
            profile: &profile,
            asset_backlog: backlog,
            now: now(),
            config: &config,
        };
        default_strategies()
            .iter()
            .filter(|s| s.applies(&ctx) && !s.plan(&ctx).is_empty())
            .map(|s| s.kind())
            .collect()
    }

    #[test]
    fn all_strategies_run_on_wifi() {
        let backlog = vec!["https://cdn.example/a.png".to_string()];
        assert_eq!(
            kinds(DeviceState::default(), &backlog),
            vec![
                PrefetchKind::FrequentItem,
                PrefetchKind::TopicAffinity,
                PrefetchKind::Asset,
                PrefetchKind::Notification,
                PrefetchKind::SearchPrediction,
            ]
        );
    }

    #[test]
    fn assets_wait_for_unmetered_network_and_storage() {
        let backlog = vec!["https://cdn.example/a.png".to_string()];
        let cellular = DeviceState {
            network: NetworkType::Cellular,
            ..DeviceState::default()
        };
        assert!(!kinds(cellular, &backlog).contains(&PrefetchKind::Asset));

        let full_disk = DeviceState {
            free_storage_mb: 10,
            ..DeviceState::default()
        };
        assert!(!kinds(full_disk, &backlog).contains(&PrefetchKind::Asset));
    }

    #[test]
    fn low_battery_keeps_only_notifications() {
        let low = DeviceState {
            battery_pct: 5,
            ..DeviceState::default()
        };
        assert_eq!(kinds(low, &[]), vec![PrefetchKind::Notification]);

        let charging = DeviceState { charging: true, ..low };
        assert!(kinds(charging, &[]).contains(&PrefetchKind::FrequentItem));
    }

    #[test]
    fn offline_plans_nothing() {
        let offline = DeviceState {
            network: NetworkType::Offline,
            ..DeviceState::default()
        };
        assert!(kinds(offline, &[]).is_empty());
    }

    #[test]
    fn busy_hour_raises_frequent_item_priority() {
        let profile = profile();
        let config = PrefetchConfig::default();
        let ctx = PrefetchContext {
            device: DeviceState::default(),
            profile: &profile,
            asset_backlog: &[],
            now: now(),
            config: &config,
        };
        let planned = FrequentItems.plan(&ctx);
        assert!(planned.iter().all(|p| p.priority == Priority::High));
        assert_eq!(planned.len(), 2);
    }
}
