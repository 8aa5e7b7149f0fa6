//! Asset reference extraction.

use serde_json::Value;

/// Receives asset URLs found in cached collections.
///
/// Implementations must return quickly; the cache calls this inline after a
/// write and never waits on the fetch itself.
pub trait AssetPrefetcher: Send + Sync {
    /// Queues asset URLs for a later fetch.
    fn enqueue_assets(&self, urls: Vec<String>);
}

/// Collects http(s) URLs from `*_url` fields, first occurrence first.
pub fn extract_asset_urls(value: &Value) -> Vec<String> {
    let mut urls = Vec::new();
    collect(value, &mut urls);
    urls
}

fn collect(value: &Value, urls: &mut Vec<String>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect(item, urls)),
        Value::Object(map) => {
            for (field, inner) in map {
                if let (true, Some(url)) = (field.ends_with("_url"), inner.as_str()) {
                    let is_http = url.starts_with("https://") || url.starts_with("http://");
                    if is_http && !urls.iter().any(|u| u == url) {
                        urls.push(url.to_string());
                    }
                } else {
                    collect(inner, urls);
                }
            }
        }
        _ => {}
    }
}
