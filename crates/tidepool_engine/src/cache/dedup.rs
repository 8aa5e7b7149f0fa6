//! Collection dedup by `(id, content hash)`.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt::Write;

/// Returns the hex SHA-256 of an item's canonical JSON.
pub fn content_hash(item: &Value) -> String {
    let digest = Sha256::digest(item.to_string().as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}

/// Drops items whose `(id, content hash)` pair was already seen.
///
/// First occurrences keep their order. Returns the kept items and the
/// number dropped.
pub fn dedup_collection(items: Vec<Value>) -> (Vec<Value>, usize) {
    let mut seen: HashSet<(Option<String>, String)> = HashSet::with_capacity(items.len());
    let total = items.len();
    let kept: Vec<Value> = items
        .into_iter()
        .filter(|item| {
            let id = item.get("id").map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            seen.insert((id, content_hash(item)))
        })
        .collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn drops_identical_repeat() {
        let a = json!({"id": "1", "content": "hello"});
        let b = json!({"id": "2", "content": "world"});
        let a2 = json!({"content": "hello", "id": "1"});

        let (kept, dropped) = dedup_collection(vec![a.clone(), b.clone(), a2]);
        assert_eq!(kept, vec![a, b]);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn same_id_different_content_is_kept() {
        let items = vec![
            json!({"id": "1", "content": "v1"}),
            json!({"id": "1", "content": "v2"}),
        ];
        let (kept, dropped) = dedup_collection(items);
        assert_eq!(kept.len(), 2);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn hash_is_stable_hex() {
        let hash = content_hash(&json!({"b": 1, "a": 2}));
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, content_hash(&json!({"a": 2, "b": 1})));
    }
}
