//! Fixed time-window grouping of cached collections.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tidepool_protocol::timestamp::{millis_to_canonical, parse_timestamp};

/// Summary of the items falling into one time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeGroup {
    /// Window start, canonical timestamp.
    pub window_start: String,
    /// Items in the window.
    pub count: usize,
    /// Id of the first item in the window.
    pub first_id: Option<String>,
    /// Id of the last item in the window.
    pub last_id: Option<String>,
}

/// Groups items into fixed windows by the timestamp in `field`.
///
/// Items without a parsable timestamp are left out. Groups come back in
/// window order.
pub fn group_by_window(items: &[Value], field: &str, window: Duration) -> Vec<TimeGroup> {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1);
    let mut groups: BTreeMap<i64, TimeGroup> = BTreeMap::new();

    for item in items {
        let Some(at) = item.get(field).and_then(parse_timestamp) else {
            continue;
        };
        let start = at.timestamp_millis().div_euclid(window_ms) * window_ms;
        let id = item.get("id").and_then(Value::as_str).map(str::to_string);
        let group = groups.entry(start).or_insert_with(|| TimeGroup {
            window_start: millis_to_canonical(start),
            count: 0,
            first_id: id.clone(),
            last_id: None,
        });
        group.count += 1;
        group.last_id = id;
    }

    groups.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn groups_into_windows() {
        let items = vec![
            json!({"id": "a", "created_at": "2026-01-01T00:01:00Z"}),
            json!({"id": "b", "created_at": "2026-01-01T00:04:59Z"}),
            json!({"id": "c", "created_at": "2026-01-01T00:05:00Z"}),
            json!({"id": "d"}),
        ];
        let groups = group_by_window(&items, "created_at", Duration::from_secs(300));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].window_start, "2026-01-01T00:00:00.000Z");
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[0].first_id.as_deref(), Some("a"));
        assert_eq!(groups[0].last_id.as_deref(), Some("b"));
        assert_eq!(groups[1].count, 1);
    }
}
