//! ics-maint - Maintenance tool for the synchronization database
//!
//! # Commands
//!
//! - `run` - Expire idle sessions and drop orphaned snapshots
//! - `expire` - Expire idle sessions only
//! - `orphans` - Drop snapshot rows of unknown sessions only
//! - `states` - Print the last cursor of sessions

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use ics::sync::{cleanup_expired_syncs, cleanup_orphaned_snapshots};
use ics::{IcsConfig, SqliteSyncStore, SyncId, run_maintenance, sync_states};

/// Synchronization database maintenance.
#[derive(Parser)]
#[command(name = "ics-maint")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the SQLite synchronization database
    #[arg(global = true, short, long, default_value = "ics.sqlite")]
    database: PathBuf,

    /// Config file, defaults to the groupware config directory
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expire idle sessions and drop orphaned snapshots
    Run {
        /// Idle days before a session expires, overrides the config
        #[arg(short, long)]
        lifetime_days: Option<u32>,
    },

    /// Expire idle sessions
    Expire {
        /// Idle days before a session expires, overrides the config
        #[arg(short, long)]
        lifetime_days: Option<u32>,
    },

    /// Drop snapshot rows of sessions that no longer exist
    Orphans,

    /// Print the last cursor of sessions as JSON
    States {
        /// Session ids to look up
        #[arg(required = true)]
        ids: Vec<SyncId>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<IcsConfig> {
    match path {
        Some(path) => IcsConfig::from_file(path)?.with_overrides(|name| std::env::var(name).ok()),
        None => IcsConfig::load(),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    let store = SqliteSyncStore::new(&cli.database)
        .with_context(|| format!("Failed to open {}", cli.database.display()))?;
    info!("Opened synchronization database {}", cli.database.display());

    match cli.command {
        Commands::Run { lifetime_days } => {
            if let Some(days) = lifetime_days {
                config.sync_lifetime_days = days;
            }
            let report = run_maintenance(&store, &config)?;
            println!(
                "expired syncs: {}, orphaned snapshot rows: {}",
                report.expired_syncs, report.orphaned_snapshot_rows
            );
        }
        Commands::Expire { lifetime_days } => {
            let days = lifetime_days.unwrap_or(config.sync_lifetime_days);
            let removed = cleanup_expired_syncs(&store, days)?;
            println!("expired syncs: {}", removed);
        }
        Commands::Orphans => {
            let removed = cleanup_orphaned_snapshots(&store)?;
            println!("orphaned snapshot rows: {}", removed);
        }
        Commands::States { ids } => {
            let states = sync_states(&store, &ids)?;
            println!("{}", serde_json::to_string_pretty(&states)?);
        }
    }
    Ok(())
}
