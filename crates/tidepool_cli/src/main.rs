//! Tidepool CLI
//!
//! Maintenance tools for the durable store of a Tidepool client.
//!
//! # Commands
//!
//! - `queue` - List persisted mutations
//! - `retry` - Return failed mutations to the active queue
//! - `cache` - Show persisted cache statistics, optionally cleaning up
//! - `archive` - Archive synced mutations past retention

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tidepool_protocol::MutationStatus;
use tracing_subscriber::EnvFilter;

/// Tidepool command-line store tools.
#[derive(Parser)]
#[command(name = "tidepool")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Mutation status filter.
#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Pending,
    Sent,
    Failed,
    Synced,
}

impl From<StatusArg> for MutationStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => MutationStatus::Pending,
            StatusArg::Sent => MutationStatus::Sent,
            StatusArg::Failed => MutationStatus::Failed,
            StatusArg::Synced => MutationStatus::Synced,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List persisted mutations
    Queue {
        /// Only show mutations in this status
        #[arg(short, long)]
        status: Option<StatusArg>,

        /// Include payloads in the output
        #[arg(long)]
        payloads: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Return failed mutations to the active queue
    Retry {
        /// Mutation id to retry
        id: Option<String>,

        /// Retry every failed mutation
        #[arg(short, long)]
        all: bool,
    },

    /// Show persisted cache statistics
    Cache {
        /// Purge expired and unparsable entries afterwards
        #[arg(short, long)]
        cleanup: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Archive synced mutations past retention
    Archive {
        /// Retention window in hours (defaults to the engine default)
        #[arg(short, long)]
        retention_hours: Option<u64>,

        /// List archived summaries instead of archiving
        #[arg(short, long)]
        list: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Queue {
            status,
            payloads,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for queue")?;
            commands::queue::run(&path, status.map(Into::into), payloads, &format)?;
        }
        Commands::Retry { id, all } => {
            let path = cli.path.ok_or("Store path required for retry")?;
            if id.is_none() && !all {
                return Err("Pass a mutation id or --all".into());
            }
            commands::retry::run(&path, id.as_deref(), all)?;
        }
        Commands::Cache { cleanup, format } => {
            let path = cli.path.ok_or("Store path required for cache")?;
            commands::cache::run(&path, cleanup, &format)?;
        }
        Commands::Archive {
            retention_hours,
            list,
        } => {
            let path = cli.path.ok_or("Store path required for archive")?;
            commands::archive::run(&path, retention_hours, list)?;
        }
        Commands::Version => {
            println!("Tidepool CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
