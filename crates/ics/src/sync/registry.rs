//! Sync session registry
//!
//! Sessions are registered against a folder once and then resume by id.
//! The registry remembers the last cursor handed out and when, which is
//! what maintenance uses to expire idle sessions.

use anyhow::Context;
use chrono::Utc;
use log::{debug, warn};

use super::{SyncContext, SyncResponse, get_content_changes};
use crate::config::IcsConfig;
use crate::error::{IcsError, IcsResult};
use crate::models::{ChangeId, SourceKey, SyncFlags, SyncId, SyncKind, SyncState};
use crate::restriction::{Restriction, RestrictionGate};
use crate::storage::SyncStore;

/// Allocate a new session bound to `folder`
pub fn register_sync(
    store: &dyn SyncStore,
    folder: &SourceKey,
    kind: SyncKind,
) -> IcsResult<SyncId> {
    let sync_id = store
        .register_sync(folder, kind, Utc::now())
        .context("Failed to register sync session")?;
    debug!("Registered {:?} sync {} for folder {}", kind, sync_id, folder);
    Ok(sync_id)
}

/// Last cursors of the known sessions among `sync_ids`
pub fn sync_states(store: &dyn SyncStore, sync_ids: &[SyncId]) -> IcsResult<Vec<SyncState>> {
    let mut states = Vec::with_capacity(sync_ids.len());
    for &sync_id in sync_ids {
        let registration = store
            .get_sync(sync_id)
            .with_context(|| format!("Failed to look up sync {}", sync_id))?;
        if let Some(registration) = registration {
            states.push(registration.state());
        }
    }
    Ok(states)
}

/// Synchronize the contents of a registered session's folder
///
/// Records the new cursor on the registration when the sync succeeds.
pub fn sync_contents(
    store: &dyn SyncStore,
    gate: &dyn RestrictionGate,
    config: &IcsConfig,
    sync_id: SyncId,
    prior_change_id: ChangeId,
    flags: SyncFlags,
    restriction: Option<Restriction>,
) -> IcsResult<SyncResponse> {
    if sync_id == 0 {
        return Err(IcsError::InvalidParameter(
            "content sync requires a registered sync id".to_string(),
        ));
    }

    let registration = store
        .get_sync(sync_id)
        .with_context(|| format!("Failed to look up sync {}", sync_id))?
        .ok_or_else(|| IcsError::NotFound(format!("sync {}", sync_id)))?;
    if registration.kind != SyncKind::Contents {
        return Err(IcsError::InvalidState(format!(
            "sync {} is a {:?} sync",
            sync_id, registration.kind
        )));
    }

    let ctx = SyncContext::new(registration.folder, sync_id, prior_change_id)
        .flags(flags)
        .restriction(restriction);
    let response = get_content_changes(store, gate, config, ctx)?;

    let updated = store
        .update_sync(sync_id, response.new_change_id, Utc::now())
        .with_context(|| format!("Failed to record cursor of sync {}", sync_id))?;
    if !updated {
        warn!("Sync {} disappeared while synchronizing", sync_id);
    }
    Ok(response)
}
