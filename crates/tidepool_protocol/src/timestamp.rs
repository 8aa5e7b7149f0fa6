//! Timestamp normalization.
//!
//! All timestamps cross the wire as RFC 3339 with millisecond precision and
//! a `Z` suffix, e.g. `2026-03-01T12:00:00.000Z`. Local rows may carry other
//! shapes (naive datetimes, bare dates, epoch seconds or milliseconds);
//! these helpers convert them.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Epoch values at or above this magnitude are read as milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Formats a time in the canonical wire format.
pub fn format_canonical(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Formats milliseconds since the Unix epoch in the canonical wire format.
///
/// Out-of-range values clamp to the epoch.
pub fn millis_to_canonical(millis: i64) -> String {
    format_canonical(DateTime::from_timestamp_millis(millis).unwrap_or_default())
}

/// Returns true if a field name holds a timestamp.
pub fn is_timestamp_field(name: &str) -> bool {
    name.ends_with("_at") || name == "timestamp" || name == "last_seen"
}

/// Parses an epoch number, guessing seconds or milliseconds by magnitude.
fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

fn parse_text(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    text.parse::<i64>().ok().and_then(from_epoch)
}

/// Parses any supported timestamp shape.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => parse_text(text),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch),
        _ => None,
    }
}

/// Converts a timestamp value to the canonical wire format.
///
/// Returns `None` if the value cannot be parsed.
pub fn normalize_timestamp(value: &Value) -> Option<String> {
    parse_timestamp(value).map(format_canonical)
}
