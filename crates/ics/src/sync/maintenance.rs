//! Periodic cleanup of sync sessions and their snapshots

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

use crate::config::IcsConfig;
use crate::error::IcsResult;
use crate::storage::SyncStore;

/// What one maintenance run removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_syncs: usize,
    pub orphaned_snapshot_rows: usize,
}

/// Remove sessions idle for longer than `lifetime_days`, `0` keeps all
pub fn cleanup_expired_syncs(store: &dyn SyncStore, lifetime_days: u32) -> IcsResult<usize> {
    expire_syncs_before(store, lifetime_days, Utc::now())
}

fn expire_syncs_before(
    store: &dyn SyncStore,
    lifetime_days: u32,
    now: DateTime<Utc>,
) -> IcsResult<usize> {
    if lifetime_days == 0 {
        return Ok(0);
    }
    let cutoff = now - Duration::days(i64::from(lifetime_days));
    let removed = store
        .delete_syncs_idle_since(cutoff)
        .context("Failed to delete expired syncs")?;
    if removed > 0 {
        info!("Removed {} syncs idle since {}", removed, cutoff);
    }
    Ok(removed)
}

/// Remove snapshot rows of sessions that no longer exist
pub fn cleanup_orphaned_snapshots(store: &dyn SyncStore) -> IcsResult<usize> {
    let removed = store
        .delete_orphaned_snapshots()
        .context("Failed to delete orphaned snapshots")?;
    if removed > 0 {
        warn!("Removed {} snapshot rows of unknown syncs", removed);
    }
    Ok(removed)
}

/// Expire idle sessions, then drop the snapshots they leave behind
pub fn run_maintenance(store: &dyn SyncStore, config: &IcsConfig) -> IcsResult<MaintenanceReport> {
    let report = MaintenanceReport {
        expired_syncs: cleanup_expired_syncs(store, config.sync_lifetime_days)?,
        orphaned_snapshot_rows: cleanup_orphaned_snapshots(store)?,
    };
    info!(
        "Maintenance complete: {} expired syncs, {} orphaned snapshot rows",
        report.expired_syncs, report.orphaned_snapshot_rows
    );
    Ok(report)
}
