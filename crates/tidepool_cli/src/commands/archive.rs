//! Archive command implementation.

use super::{open_queue, open_store};
use std::path::Path;
use std::time::Duration;
use tidepool_engine::QueueConfig;
use tidepool_protocol::timestamp::millis_to_canonical;

/// Archives synced mutations in batches until none remain past retention.
///
/// Returns the number archived.
pub fn archive(
    path: &Path,
    retention_hours: Option<u64>,
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut config = QueueConfig::default();
    if let Some(hours) = retention_hours {
        config = config.with_retention(Duration::from_secs(hours * 3600));
    }
    let queue = open_queue(open_store(path)?, config)?;

    let mut archived = 0;
    loop {
        let report = queue.cleanup_synced()?;
        archived += report.archived;
        if !report.has_more {
            break;
        }
    }
    Ok(archived)
}

/// Runs the archive command.
pub fn run(
    path: &Path,
    retention_hours: Option<u64>,
    list: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !list {
        let archived = archive(path, retention_hours)?;
        println!("Archived {archived} synced mutation(s)");
        return Ok(());
    }

    let queue = open_queue(open_store(path)?, QueueConfig::default())?;
    let summaries = queue.archived()?;
    if summaries.is_empty() {
        println!("Archive is empty");
        return Ok(());
    }
    for summary in &summaries {
        println!(
            "{:<38} {:<14} {:<8} {} -> {} ({} retries)",
            summary.id,
            summary.entity_type,
            format!("{:?}", summary.action).to_lowercase(),
            millis_to_canonical(summary.created_at),
            summary
                .synced_at
                .map(millis_to_canonical)
                .unwrap_or_else(|| "-".to_string()),
            summary.retry_count,
        );
    }
    println!();
    println!("{} archived mutation(s)", summaries.len());
    Ok(())
}
