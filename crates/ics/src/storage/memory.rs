//! In-memory storage implementation
//!
//! Used by tests and by embedders that do not need persistence. Mirrors the
//! query semantics of the SQLite store.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{FullQuery, IncrementalQuery, SnapshotCommit, SyncStore};
use crate::models::{
    CandidateRow, ChangeId, ChangeRecord, ChangeType, LiveObject, MessageEntry, MessageSet,
    NewChange, SourceKey, SyncId, SyncKind, SyncRegistration, object_flags,
};

/// Snapshot rows keyed by (sync id, generation): source key to parent
type SnapshotTable = BTreeMap<(SyncId, ChangeId), BTreeMap<SourceKey, SourceKey>>;

#[derive(Default)]
struct ObjectTable {
    next_id: u64,
    /// Source key to (insertion id, object)
    rows: HashMap<SourceKey, (u64, LiveObject)>,
}

#[derive(Default)]
struct SyncTable {
    next_id: SyncId,
    rows: BTreeMap<SyncId, SyncRegistration>,
}

/// In-memory implementation of SyncStore
///
/// Collections are protected by RwLocks for thread-safe access. Ids are
/// allocated under the write lock, so they are never reused.
#[derive(Default)]
pub struct InMemorySyncStore {
    changes: RwLock<Vec<ChangeRecord>>,
    objects: RwLock<ObjectTable>,
    snapshots: RwLock<SnapshotTable>,
    syncs: RwLock<SyncTable>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| anyhow!("In-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| anyhow!("In-memory store lock poisoned"))
}

fn remove_generations(
    snapshots: &mut SnapshotTable,
    sync_id: SyncId,
    change_ids: &[ChangeId],
) -> usize {
    change_ids
        .iter()
        .filter_map(|change_id| snapshots.remove(&(sync_id, *change_id)))
        .map(|rows| rows.len())
        .sum()
}

fn insert_generation(
    snapshots: &mut SnapshotTable,
    sync_id: SyncId,
    change_id: ChangeId,
    messages: &MessageSet,
) {
    let rows = snapshots.entry((sync_id, change_id)).or_default();
    for (source_key, entry) in messages.iter() {
        rows.insert(source_key.clone(), entry.parent_source_key.clone());
    }
}

impl InMemorySyncStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of change records, markers included
    pub fn change_count(&self) -> Result<usize> {
        Ok(read(&self.changes)?.len())
    }
}

impl SyncStore for InMemorySyncStore {
    fn append_change(&self, change: &NewChange) -> Result<ChangeId> {
        let mut changes = write(&self.changes)?;
        let id = changes.last().map_or(1, |last| last.id + 1);
        changes.push(ChangeRecord {
            id,
            source_key: change.source_key.clone(),
            parent_source_key: change.parent_source_key.clone(),
            change_type: change.change_type,
            flags: change.flags,
            source_sync: change.source_sync,
        });
        Ok(id)
    }

    fn max_change_id(&self, folder: &SourceKey) -> Result<ChangeId> {
        let changes = read(&self.changes)?;
        Ok(changes
            .iter()
            .rev()
            .find(|c| folder.is_empty() || c.parent_source_key == *folder)
            .map_or(0, |c| c.id))
    }

    fn incremental_candidates(&self, query: &IncrementalQuery) -> Result<Vec<CandidateRow>> {
        let changes = read(&self.changes)?;
        let rows = changes
            .iter()
            .filter(|c| c.id > query.after_change_id)
            .filter(|c| c.change_type.is_message() && c.source_sync != query.sync_id)
            .filter(|c| query.folder.is_empty() || c.parent_source_key == query.folder)
            .filter(|c| query.flags.admits_item(c.flags))
            .filter(|c| query.flags.admits_action(c.change_type))
            .map(|c| CandidateRow {
                change_id: c.id,
                source_key: c.source_key.clone(),
                parent_source_key: c.parent_source_key.clone(),
                change_type: c.change_type,
                change_flags: c.flags,
                object_flags: None,
                source_sync: c.source_sync,
            })
            .collect();
        Ok(rows)
    }

    fn full_candidates(&self, query: &FullQuery) -> Result<Vec<CandidateRow>> {
        let objects = read(&self.objects)?;
        let changes = read(&self.changes)?;

        let mut live: Vec<&(u64, LiveObject)> = objects
            .rows
            .values()
            .filter(|(_, o)| o.parent_source_key == query.folder)
            .filter(|(_, o)| o.flags & object_flags::DELETED == 0)
            .filter(|(_, o)| query.flags.admits_item(o.flags))
            .collect();
        live.sort_by(|a, b| b.0.cmp(&a.0));

        let mut rows = Vec::with_capacity(live.len());
        for (_, object) in live {
            let created = changes.iter().rev().find(|c| {
                c.change_type == ChangeType::MESSAGE_NEW
                    && c.source_key == object.source_key
                    && c.parent_source_key == object.parent_source_key
            });
            if let (Some(author), Some(created)) = (query.exclude_author, created) {
                if created.source_sync == author {
                    continue;
                }
            }
            rows.push(CandidateRow {
                change_id: created.map_or(0, |c| c.id),
                source_key: object.source_key.clone(),
                parent_source_key: object.parent_source_key.clone(),
                change_type: ChangeType::MESSAGE_NEW,
                change_flags: 0,
                object_flags: Some(object.flags),
                source_sync: created.map_or(0, |c| c.source_sync),
            });
        }
        Ok(rows)
    }

    fn put_object(&self, object: &LiveObject) -> Result<()> {
        let mut objects = write(&self.objects)?;
        if let Some((_, existing)) = objects.rows.get_mut(&object.source_key) {
            *existing = object.clone();
            return Ok(());
        }
        objects.next_id += 1;
        let id = objects.next_id;
        objects
            .rows
            .insert(object.source_key.clone(), (id, object.clone()));
        Ok(())
    }

    fn remove_object(&self, source_key: &SourceKey) -> Result<bool> {
        Ok(write(&self.objects)?.rows.remove(source_key).is_some())
    }

    fn load_snapshot(&self, sync_id: SyncId, change_id: ChangeId) -> Result<MessageSet> {
        let snapshots = read(&self.snapshots)?;
        let Some(rows) = snapshots.get(&(sync_id, change_id)) else {
            return Ok(MessageSet::new());
        };
        let changes = read(&self.changes)?;

        let mut set = MessageSet::new();
        for (source_key, parent) in rows {
            let mut entry = MessageEntry::new(parent.clone());
            for change in changes.iter().filter(|c| {
                c.id > change_id
                    && c.change_type.is_message()
                    && c.source_sync != sync_id
                    && c.source_key == *source_key
                    && c.parent_source_key == *parent
            }) {
                entry.accumulate(change.change_type, change.flags);
            }
            set.insert(source_key.clone(), entry);
        }
        Ok(set)
    }

    fn snapshot_generations(&self, sync_id: SyncId) -> Result<Vec<ChangeId>> {
        let snapshots = read(&self.snapshots)?;
        Ok(snapshots
            .range((sync_id, 0)..=(sync_id, ChangeId::MAX))
            .filter(|(_, rows)| !rows.is_empty())
            .map(|((_, change_id), _)| *change_id)
            .collect())
    }

    fn write_snapshot(
        &self,
        sync_id: SyncId,
        change_id: ChangeId,
        messages: &MessageSet,
    ) -> Result<()> {
        let mut snapshots = write(&self.snapshots)?;
        insert_generation(&mut snapshots, sync_id, change_id, messages);
        Ok(())
    }

    fn delete_snapshot_generations(
        &self,
        sync_id: SyncId,
        change_ids: &[ChangeId],
    ) -> Result<usize> {
        let mut snapshots = write(&self.snapshots)?;
        Ok(remove_generations(&mut snapshots, sync_id, change_ids))
    }

    fn delete_snapshots_after(&self, sync_id: SyncId, change_id: ChangeId) -> Result<usize> {
        let mut snapshots = write(&self.snapshots)?;
        let newer: Vec<ChangeId> = snapshots
            .range((sync_id, change_id.saturating_add(1))..=(sync_id, ChangeId::MAX))
            .map(|((_, id), _)| *id)
            .collect();
        Ok(remove_generations(&mut snapshots, sync_id, &newer))
    }

    fn commit_snapshot(&self, commit: &SnapshotCommit<'_>) -> Result<()> {
        let mut snapshots = write(&self.snapshots)?;
        remove_generations(&mut snapshots, commit.sync_id, commit.obsolete);
        insert_generation(
            &mut snapshots,
            commit.sync_id,
            commit.change_id,
            commit.messages,
        );
        Ok(())
    }

    fn add_snapshot_entry(
        &self,
        sync_id: SyncId,
        change_id: ChangeId,
        source_key: &SourceKey,
        parent_source_key: &SourceKey,
    ) -> Result<()> {
        let mut snapshots = write(&self.snapshots)?;
        snapshots
            .entry((sync_id, change_id))
            .or_default()
            .entry(source_key.clone())
            .or_insert_with(|| parent_source_key.clone());
        Ok(())
    }

    fn remove_snapshot_entry(
        &self,
        sync_id: SyncId,
        change_id: ChangeId,
        source_key: &SourceKey,
    ) -> Result<bool> {
        let mut snapshots = write(&self.snapshots)?;
        let Some(rows) = snapshots.get_mut(&(sync_id, change_id)) else {
            return Ok(false);
        };
        let removed = rows.remove(source_key).is_some();
        if rows.is_empty() {
            snapshots.remove(&(sync_id, change_id));
        }
        Ok(removed)
    }

    fn snapshot_contains(
        &self,
        sync_id: SyncId,
        change_id: ChangeId,
        source_key: &SourceKey,
    ) -> Result<bool> {
        let snapshots = read(&self.snapshots)?;
        Ok(snapshots
            .get(&(sync_id, change_id))
            .is_some_and(|rows| rows.contains_key(source_key)))
    }

    fn delete_orphaned_snapshots(&self) -> Result<usize> {
        let syncs = read(&self.syncs)?;
        let mut snapshots = write(&self.snapshots)?;
        let mut removed = 0;
        snapshots.retain(|(sync_id, _), rows| {
            let keep = syncs.rows.contains_key(sync_id);
            if !keep {
                removed += rows.len();
            }
            keep
        });
        Ok(removed)
    }

    fn register_sync(
        &self,
        folder: &SourceKey,
        kind: SyncKind,
        at: DateTime<Utc>,
    ) -> Result<SyncId> {
        let mut syncs = write(&self.syncs)?;
        syncs.next_id += 1;
        let sync_id = syncs.next_id;
        let mut registration = SyncRegistration::new(sync_id, folder.clone(), kind);
        registration.sync_time = at;
        syncs.rows.insert(sync_id, registration);
        Ok(sync_id)
    }

    fn get_sync(&self, sync_id: SyncId) -> Result<Option<SyncRegistration>> {
        Ok(read(&self.syncs)?.rows.get(&sync_id).cloned())
    }

    fn update_sync(&self, sync_id: SyncId, change_id: ChangeId, at: DateTime<Utc>) -> Result<bool> {
        let mut syncs = write(&self.syncs)?;
        let Some(registration) = syncs.rows.get_mut(&sync_id) else {
            return Ok(false);
        };
        registration.record_sync(change_id, at);
        Ok(true)
    }

    fn is_folder_tracked(&self, folder: &SourceKey) -> Result<bool> {
        Ok(read(&self.syncs)?
            .rows
            .values()
            .any(|registration| registration.folder == *folder))
    }

    fn delete_syncs_idle_since(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut syncs = write(&self.syncs)?;
        let before = syncs.rows.len();
        syncs
            .rows
            .retain(|_, registration| !registration.idle_since(cutoff));
        Ok(before - syncs.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SyncFlags, change_flags};

    fn key(s: &str) -> SourceKey {
        SourceKey::from(s)
    }

    fn set_of(folder: &str, keys: &[&str]) -> MessageSet {
        keys.iter()
            .map(|k| (key(k), MessageEntry::new(key(folder))))
            .collect()
    }

    #[test]
    fn test_change_ids_are_monotonic() {
        let store = InMemorySyncStore::new();
        let a = store
            .append_change(&NewChange::new("A", "F", ChangeType::MESSAGE_NEW))
            .unwrap();
        let b = store
            .append_change(&NewChange::new("B", "G", ChangeType::MESSAGE_NEW))
            .unwrap();
        assert!(b > a);
        assert_eq!(store.max_change_id(&key("F")).unwrap(), a);
        assert_eq!(store.max_change_id(&key("G")).unwrap(), b);
        assert_eq!(store.max_change_id(&SourceKey::empty()).unwrap(), b);
        assert_eq!(store.max_change_id(&key("H")).unwrap(), 0);
    }

    #[test]
    fn test_incremental_candidates() {
        let store = InMemorySyncStore::new();
        store
            .append_change(&NewChange::new("A", "F", ChangeType::MESSAGE_NEW))
            .unwrap();
        store
            .append_change(&NewChange::new("B", "F", ChangeType::MESSAGE_NEW).authored_by(5))
            .unwrap();
        store
            .append_change(&NewChange::new("C", "F", ChangeType::MESSAGE_FLAG))
            .unwrap();
        store
            .append_change(&NewChange::new("F", "ROOT", ChangeType::FOLDER_CHANGE))
            .unwrap();

        let query = IncrementalQuery {
            folder: SourceKey::empty(),
            sync_id: 5,
            after_change_id: 0,
            flags: SyncFlags(SyncFlags::NORMAL),
        };
        let rows = store.incremental_candidates(&query).unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.source_key.clone()).collect();
        assert_eq!(keys, vec![key("A")]);
    }

    #[test]
    fn test_full_candidates_newest_first() {
        let store = InMemorySyncStore::new();
        store.put_object(&LiveObject::new("A", "F")).unwrap();
        store.put_object(&LiveObject::new("B", "F")).unwrap();
        store
            .put_object(&LiveObject::new("C", "F").with_flags(object_flags::DELETED))
            .unwrap();
        store.put_object(&LiveObject::new("D", "G")).unwrap();
        let created = store
            .append_change(&NewChange::new("B", "F", ChangeType::MESSAGE_NEW).authored_by(2))
            .unwrap();

        let query = FullQuery {
            folder: key("F"),
            flags: SyncFlags::all_items(),
            exclude_author: None,
        };
        let rows = store.full_candidates(&query).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].source_key, key("B"));
        assert_eq!(rows[0].change_id, created);
        assert_eq!(rows[0].source_sync, 2);
        assert_eq!(rows[1].source_key, key("A"));
        assert_eq!(rows[1].change_id, 0);

        let excluding = FullQuery {
            exclude_author: Some(2),
            ..query
        };
        let rows = store.full_candidates(&excluding).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_key, key("A"));
    }

    #[test]
    fn test_load_snapshot_accumulates_later_changes() {
        let store = InMemorySyncStore::new();
        let base = store
            .append_change(&NewChange::new("A", "F", ChangeType::MESSAGE_NEW))
            .unwrap();
        store
            .write_snapshot(7, base, &set_of("F", &["A", "B"]))
            .unwrap();
        store
            .append_change(&NewChange::new("A", "F", ChangeType::MESSAGE_FLAG).flags(1))
            .unwrap();
        store
            .append_change(&NewChange::new("B", "F", ChangeType::MESSAGE_CHANGE).authored_by(7))
            .unwrap();

        let set = store.load_snapshot(7, base).unwrap();
        assert_eq!(set.len(), 2);
        let a = set.get(&key("A")).unwrap();
        assert_eq!(a.change_types, change_flags::FLAG);
        assert_eq!(a.flags, 1);
        assert_eq!(set.get(&key("B")).unwrap().change_types, 0);
    }

    #[test]
    fn test_commit_snapshot_replaces_generations() {
        let store = InMemorySyncStore::new();
        store.write_snapshot(1, 10, &set_of("F", &["A"])).unwrap();
        store.write_snapshot(1, 20, &set_of("F", &["B"])).unwrap();
        let messages = set_of("F", &["C"]);
        store
            .commit_snapshot(&SnapshotCommit {
                sync_id: 1,
                change_id: 30,
                messages: &messages,
                obsolete: &[20],
            })
            .unwrap();
        assert_eq!(store.snapshot_generations(1).unwrap(), vec![10, 30]);
        assert_eq!(store.latest_snapshot_generation(1).unwrap(), Some(30));
    }

    #[test]
    fn test_delete_snapshots_after() {
        let store = InMemorySyncStore::new();
        for generation in [5, 10, 15] {
            store
                .write_snapshot(3, generation, &set_of("F", &["A", "B"]))
                .unwrap();
        }
        store.write_snapshot(4, 15, &set_of("F", &["A"])).unwrap();
        assert_eq!(store.delete_snapshots_after(3, 5).unwrap(), 4);
        assert_eq!(store.snapshot_generations(3).unwrap(), vec![5]);
        assert_eq!(store.snapshot_generations(4).unwrap(), vec![15]);
    }

    #[test]
    fn test_snapshot_entries() {
        let store = InMemorySyncStore::new();
        store.add_snapshot_entry(2, 8, &key("A"), &key("F")).unwrap();
        assert!(store.snapshot_contains(2, 8, &key("A")).unwrap());
        assert!(store.remove_snapshot_entry(2, 8, &key("A")).unwrap());
        assert!(!store.remove_snapshot_entry(2, 8, &key("A")).unwrap());
        assert!(store.snapshot_generations(2).unwrap().is_empty());
    }

    #[test]
    fn test_sync_registry() {
        let store = InMemorySyncStore::new();
        let now = Utc::now();
        let first = store.register_sync(&key("F"), SyncKind::Contents, now).unwrap();
        let second = store
            .register_sync(&key("G"), SyncKind::Hierarchy, now - chrono::Duration::days(30))
            .unwrap();
        assert_ne!(first, second);
        assert!(store.is_folder_tracked(&key("F")).unwrap());
        assert!(!store.is_folder_tracked(&key("H")).unwrap());

        assert!(store.update_sync(first, 42, now).unwrap());
        assert_eq!(store.get_sync(first).unwrap().unwrap().change_id, 42);
        assert!(!store.update_sync(99, 1, now).unwrap());

        let removed = store
            .delete_syncs_idle_since(now - chrono::Duration::days(1))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_sync(second).unwrap().is_none());

        let third = store.register_sync(&key("G"), SyncKind::Contents, now).unwrap();
        assert!(third > second);
    }

    #[test]
    fn test_delete_orphaned_snapshots() {
        let store = InMemorySyncStore::new();
        let sync_id = store
            .register_sync(&key("F"), SyncKind::Contents, Utc::now())
            .unwrap();
        store.write_snapshot(sync_id, 4, &set_of("F", &["A"])).unwrap();
        store.write_snapshot(77, 4, &set_of("F", &["A", "B"])).unwrap();
        assert_eq!(store.delete_orphaned_snapshots().unwrap(), 2);
        assert_eq!(store.snapshot_generations(sync_id).unwrap(), vec![4]);
    }
}
