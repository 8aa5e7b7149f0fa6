//! Retry command implementation.

use super::{open_queue, open_store};
use std::path::Path;
use tidepool_engine::QueueConfig;
use tracing::info;

/// Returns failed mutations to pending and reports how many moved.
pub fn retry(
    path: &Path,
    id: Option<&str>,
    all: bool,
) -> Result<usize, Box<dyn std::error::Error>> {
    let queue = open_queue(open_store(path)?, QueueConfig::default())?;

    let ids: Vec<String> = if all {
        queue.failed_mutations().into_iter().map(|m| m.id).collect()
    } else {
        id.map(str::to_string).into_iter().collect()
    };

    for id in &ids {
        queue.retry_failed(id)?;
    }
    info!(retried = ids.len(), "failed mutations returned to queue");
    Ok(ids.len())
}

/// Runs the retry command.
pub fn run(path: &Path, id: Option<&str>, all: bool) -> Result<(), Box<dyn std::error::Error>> {
    let count = retry(path, id, all)?;
    if count == 0 {
        println!("No failed mutations");
    } else {
        println!("{count} mutation(s) returned to the queue");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn unknown_id_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tidepool.json");
        std::fs::write(&path, "{}").unwrap();

        assert!(retry(&path, Some("nope"), false).is_err());
        assert_eq!(retry(&path, None, true).unwrap(), 0);
    }
}
