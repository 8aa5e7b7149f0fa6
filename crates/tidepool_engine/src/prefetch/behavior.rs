//! Per-user behavior profiles.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tidepool_protocol::Table;

/// Recent notification targets kept per profile.
const NOTIFICATION_HISTORY: usize = 10;

/// A row the user touched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Table of the row.
    pub table: Table,
    /// Primary key.
    pub id: String,
}

impl EntityRef {
    /// Creates a reference.
    pub fn new(table: Table, id: impl Into<String>) -> Self {
        Self {
            table,
            id: id.into(),
        }
    }

    fn key(&self) -> String {
        format!("{}:{}", self.table.as_str(), self.id)
    }

    fn parse(key: &str) -> Option<Self> {
        let (table, id) = key.split_once(':')?;
        let table = Table::from_name(table).ok()?;
        Some(Self::new(table, id))
    }
}

/// A tracked user action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activity {
    /// The user opened a row.
    View {
        /// Row viewed.
        entity: EntityRef,
        /// Topic the row belongs to, such as a conversation id.
        #[serde(default)]
        topic: Option<String>,
    },
    /// The user wrote a row.
    Write {
        /// Row written.
        entity: EntityRef,
        /// Topic the row belongs to.
        #[serde(default)]
        topic: Option<String>,
    },
    /// The user ran a search.
    Search {
        /// Search text.
        term: String,
    },
    /// The user opened a notification.
    NotificationOpen {
        /// Row the notification points at.
        entity: EntityRef,
    },
}

impl Activity {
    /// Counter increment for this activity.
    pub fn weight(&self) -> u64 {
        match self {
            Activity::View { .. } | Activity::Search { .. } => 1,
            Activity::NotificationOpen { .. } => 2,
            Activity::Write { .. } => 3,
        }
    }
}

/// Affinity counters of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorProfile {
    /// Owner of the profile.
    pub user_id: String,
    /// Weighted access count per `table:id`.
    #[serde(default)]
    pub entity_access: HashMap<String, u64>,
    /// Weighted interest per topic.
    #[serde(default)]
    pub topic_interest: HashMap<String, u64>,
    /// Activity count per UTC hour of day.
    #[serde(default)]
    pub active_hours: [u32; 24],
    /// Count per normalized search term.
    #[serde(default)]
    pub search_terms: HashMap<String, u64>,
    /// Most recent notification targets, newest last.
    #[serde(default)]
    pub recent_notifications: Vec<EntityRef>,
    /// Last update in milliseconds since the Unix epoch.
    #[serde(default)]
    pub updated_at: i64,
}

impl BehaviorProfile {
    /// Creates an empty profile.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            entity_access: HashMap::new(),
            topic_interest: HashMap::new(),
            active_hours: [0; 24],
            search_terms: HashMap::new(),
            recent_notifications: Vec::new(),
            updated_at: 0,
        }
    }

    /// Folds one activity into the counters.
    pub fn record(&mut self, activity: &Activity, at: DateTime<Utc>) {
        let weight = activity.weight();
        match activity {
            Activity::View { entity, topic } | Activity::Write { entity, topic } => {
                *self.entity_access.entry(entity.key()).or_default() += weight;
                if let Some(topic) = topic {
                    *self.topic_interest.entry(topic.clone()).or_default() += weight;
                }
            }
            Activity::Search { term } => {
                let term = term.trim().to_lowercase();
                if !term.is_empty() {
                    *self.search_terms.entry(term).or_default() += weight;
                }
            }
            Activity::NotificationOpen { entity } => {
                *self.entity_access.entry(entity.key()).or_default() += weight;
                self.recent_notifications.retain(|e| e != entity);
                self.recent_notifications.push(entity.clone());
                if self.recent_notifications.len() > NOTIFICATION_HISTORY {
                    self.recent_notifications.remove(0);
                }
            }
        }
        if let Some(slot) = self.active_hours.get_mut(at.hour() as usize) {
            *slot += 1;
        }
        self.updated_at = at.timestamp_millis();
    }

    /// Most accessed rows, highest count first.
    pub fn top_entities(&self, limit: usize) -> Vec<EntityRef> {
        top_keys(&self.entity_access, limit)
            .into_iter()
            .filter_map(|key| EntityRef::parse(&key))
            .collect()
    }

    /// Most interesting topics, highest interest first.
    pub fn top_topics(&self, limit: usize) -> Vec<String> {
        top_keys(&self.topic_interest, limit)
    }

    /// Most frequent search terms.
    pub fn top_search_terms(&self, limit: usize) -> Vec<String> {
        top_keys(&self.search_terms, limit)
    }

    /// Returns true if `hour` is at least half as busy as the busiest hour.
    pub fn is_active_hour(&self, hour: u32) -> bool {
        let peak = self.active_hours.iter().copied().max().unwrap_or(0);
        let count = self.active_hours.get(hour as usize).copied().unwrap_or(0);
        peak > 0 && count * 2 >= peak
    }
}

// Ties break on the key so plans are deterministic.
fn top_keys(counts: &HashMap<String, u64>, limit: usize) -> Vec<String> {
    let mut ranked: Vec<(&String, &u64)> = counts.iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(key, _)| key.clone())
        .collect()
}
