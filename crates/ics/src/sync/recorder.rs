//! Change-log recording
//!
//! Every mutation of a synchronizable object is appended to the change log
//! here. Changes a session makes itself are also folded into that session's
//! newest snapshot so its next restricted sync does not echo them back.

use anyhow::Context;
use log::{debug, trace};

use crate::config::IcsConfig;
use crate::error::{IcsError, IcsResult};
use crate::models::{ChangeId, ChangeType, NewChange, SourceKey, SyncId};
use crate::storage::SyncStore;

fn validate(change: &NewChange) -> IcsResult<()> {
    if !change.change_type.is_recordable() {
        return Err(IcsError::InvalidParameter(format!(
            "change type {} cannot be recorded",
            change.change_type
        )));
    }
    if change.source_key.is_empty() || change.parent_source_key.is_empty() {
        return Err(IcsError::InvalidParameter(
            "change requires a source key and a parent source key".to_string(),
        ));
    }
    if change.source_key == change.parent_source_key {
        return Err(IcsError::InvalidParameter(format!(
            "object {} cannot be its own parent",
            change.source_key
        )));
    }
    Ok(())
}

/// Append a change to the log
///
/// # Returns
/// The allocated change id, or `None` when the change was skipped because
/// nothing tracks its folder and `log_all_changes` is off
pub fn record_change(
    store: &dyn SyncStore,
    config: &IcsConfig,
    change: &NewChange,
) -> IcsResult<Option<ChangeId>> {
    validate(change)?;

    if change.change_type.is_message() && !config.log_all_changes {
        let tracked = store
            .is_folder_tracked(&change.parent_source_key)
            .context("Failed to look up folder sessions")?;
        if !tracked {
            trace!(
                "Skipping change of {} in untracked folder {}",
                change.source_key, change.parent_source_key
            );
            return Ok(None);
        }
    }

    let change_id = store
        .append_change(change)
        .context("Failed to append change")?;

    if change.source_sync != 0 && change.change_type.is_message() {
        follow_own_change(store, change)?;
    }

    debug!(
        "Recorded change {} ({}) of {} by sync {}",
        change_id, change.change_type, change.source_key, change.source_sync
    );
    Ok(Some(change_id))
}

/// Keep the author's newest snapshot in step with its own write
fn follow_own_change(store: &dyn SyncStore, change: &NewChange) -> IcsResult<()> {
    let Some(generation) = store
        .latest_snapshot_generation(change.source_sync)
        .context("Failed to find newest snapshot generation")?
    else {
        return Ok(());
    };

    if change.change_type.is_delete() {
        store
            .remove_snapshot_entry(change.source_sync, generation, &change.source_key)
            .context("Failed to drop deleted object from snapshot")?;
    } else if change.change_type == ChangeType::MESSAGE_NEW {
        store
            .add_snapshot_entry(
                change.source_sync,
                generation,
                &change.source_key,
                &change.parent_source_key,
            )
            .context("Failed to add created object to snapshot")?;
    }
    Ok(())
}

/// Whether `source_key` is in the newest snapshot generation of `sync_id`
pub fn within_latest_snapshot(
    store: &dyn SyncStore,
    sync_id: SyncId,
    source_key: &SourceKey,
) -> IcsResult<bool> {
    let Some(generation) = store
        .latest_snapshot_generation(sync_id)
        .context("Failed to find newest snapshot generation")?
    else {
        return Ok(false);
    };
    Ok(store
        .snapshot_contains(sync_id, generation, source_key)
        .context("Failed to look up snapshot entry")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageEntry, MessageSet, SyncKind};
    use crate::storage::InMemorySyncStore;
    use chrono::Utc;

    #[test]
    fn test_rejects_invalid_changes() {
        let store = InMemorySyncStore::new();
        let config = IcsConfig::default();

        let marker = NewChange::new("A", "F", ChangeType::MARKER);
        let own_parent = NewChange::new("F", "F", ChangeType::MESSAGE_NEW);
        let no_parent = NewChange::new("A", SourceKey::empty(), ChangeType::MESSAGE_NEW);

        for change in [marker, own_parent, no_parent] {
            let err = record_change(&store, &config, &change).unwrap_err();
            assert!(matches!(err, IcsError::InvalidParameter(_)));
        }
        assert_eq!(store.change_count().unwrap(), 0);
    }

    #[test]
    fn test_untracked_folder_is_skipped() {
        let store = InMemorySyncStore::new();
        let config = IcsConfig {
            log_all_changes: false,
            ..IcsConfig::default()
        };
        let change = NewChange::new("A", "F", ChangeType::MESSAGE_NEW);
        assert_eq!(record_change(&store, &config, &change).unwrap(), None);

        store
            .register_sync(&SourceKey::from("F"), SyncKind::Contents, Utc::now())
            .unwrap();
        assert_eq!(record_change(&store, &config, &change).unwrap(), Some(1));

        // Folder changes are always recorded
        let folder = NewChange::new("G", "H", ChangeType::FOLDER_NEW);
        assert!(record_change(&store, &config, &folder).unwrap().is_some());
    }

    #[test]
    fn test_own_changes_follow_snapshot() {
        let store = InMemorySyncStore::new();
        let config = IcsConfig::default();
        let folder = SourceKey::from("F");
        let mut snapshot = MessageSet::new();
        snapshot.insert(SourceKey::from("A"), MessageEntry::new(folder.clone()));
        store.write_snapshot(4, 1, &snapshot).unwrap();
        store.write_snapshot(4, 3, &snapshot).unwrap();

        let created = NewChange::new("B", "F", ChangeType::MESSAGE_NEW).authored_by(4);
        record_change(&store, &config, &created).unwrap();
        assert!(within_latest_snapshot(&store, 4, &SourceKey::from("B")).unwrap());
        assert!(!store.snapshot_contains(4, 1, &SourceKey::from("B")).unwrap());

        let deleted = NewChange::new("A", "F", ChangeType::MESSAGE_HARD_DELETE).authored_by(4);
        record_change(&store, &config, &deleted).unwrap();
        assert!(!within_latest_snapshot(&store, 4, &SourceKey::from("A")).unwrap());

        // Server-side changes leave snapshots alone
        let server = NewChange::new("C", "F", ChangeType::MESSAGE_NEW);
        record_change(&store, &config, &server).unwrap();
        assert!(!within_latest_snapshot(&store, 4, &SourceKey::from("C")).unwrap());
    }

    #[test]
    fn test_within_latest_snapshot_without_snapshot() {
        let store = InMemorySyncStore::new();
        assert!(!within_latest_snapshot(&store, 9, &SourceKey::from("A")).unwrap());
    }
}
