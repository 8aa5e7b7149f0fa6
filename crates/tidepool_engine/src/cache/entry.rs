//! Cache entries.

use super::compression::decompress;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One cached payload, as held in memory and in the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key inside the domain.
    pub key: String,
    /// Serialized payload, possibly compressed.
    pub value: String,
    /// Write time in milliseconds.
    pub created_at: i64,
    /// Time to live in milliseconds.
    pub ttl_ms: i64,
    /// Whether `value` was compressed.
    #[serde(default)]
    pub compressed: bool,
}

impl CacheEntry {
    /// Returns true once the TTL has elapsed at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.created_at.saturating_add(self.ttl_ms)
    }

    /// Returns the entry's age at `now`.
    pub fn age(&self, now: i64) -> i64 {
        now.saturating_sub(self.created_at)
    }

    /// Decodes the payload, expanding it first when `compressed` is set.
    pub fn decode(&self) -> Option<Value> {
        if self.compressed {
            serde_json::from_str(&decompress(&self.value)?).ok()
        } else {
            serde_json::from_str(&self.value).ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expiry_boundary() {
        let entry = CacheEntry {
            key: "k".into(),
            value: "1".into(),
            created_at: 1_000,
            ttl_ms: 500,
            compressed: false,
        };
        assert!(!entry.is_expired(1_499));
        assert!(entry.is_expired(1_500));
        assert_eq!(entry.age(1_200), 200);
        assert_eq!(entry.decode(), Some(json!(1)));
    }

    #[test]
    fn compressed_payload_is_expanded_on_decode() {
        let entry = CacheEntry {
            key: "k".into(),
            value: r#"{"text":"a~6 b~~"}"#.into(),
            created_at: 0,
            ttl_ms: 1,
            compressed: true,
        };
        assert_eq!(entry.decode(), Some(json!({"text": "a      b~"})));

        let raw = CacheEntry {
            compressed: false,
            ..entry
        };
        assert_eq!(raw.decode(), Some(json!({"text": "a~6 b~~"})));
    }
}
