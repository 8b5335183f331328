//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{
    CandidateRow, ChangeId, LiveObject, MessageSet, NewChange, SourceKey, SyncFlags, SyncId,
    SyncKind, SyncRegistration,
};

/// Parameters of the change-log candidate scan
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalQuery {
    /// Folder scope, empty for the whole server
    pub folder: SourceKey,
    /// Session whose own changes are skipped
    pub sync_id: SyncId,
    /// Only changes with a greater id are returned
    pub after_change_id: ChangeId,
    pub flags: SyncFlags,
}

/// Parameters of the live-object candidate scan
#[derive(Debug, Clone, PartialEq)]
pub struct FullQuery {
    /// Folder scope, never empty
    pub folder: SourceKey,
    pub flags: SyncFlags,
    /// Drop objects whose newest `MESSAGE_NEW` record this session authored
    pub exclude_author: Option<SyncId>,
}

/// A snapshot generation to write, with the generations it supersedes
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCommit<'a> {
    pub sync_id: SyncId,
    pub change_id: ChangeId,
    pub messages: &'a MessageSet,
    /// Generations deleted before the new one is written
    pub obsolete: &'a [ChangeId],
}

/// Trait for synchronization storage operations
///
/// Backends own the change log, the live-object index, per-session cursor
/// snapshots and the session registry. Change ids must come from an atomic,
/// never-reused allocation primitive of the backend.
pub trait SyncStore: Send + Sync {
    // === Change log ===

    /// Append a change record and return its newly allocated id
    fn append_change(&self, change: &NewChange) -> Result<ChangeId>;

    /// Highest change id recorded in `folder` (whole server when empty), `0` if none
    fn max_change_id(&self, folder: &SourceKey) -> Result<ChangeId>;

    /// Message changes after a cursor, ordered by id ascending
    fn incremental_candidates(&self, query: &IncrementalQuery) -> Result<Vec<CandidateRow>>;

    /// Live message objects of a folder, newest object first
    fn full_candidates(&self, query: &FullQuery) -> Result<Vec<CandidateRow>>;

    // === Live objects ===

    /// Insert or update a live object, keeping its position if it already exists
    fn put_object(&self, object: &LiveObject) -> Result<()>;

    /// Remove a live object, returning whether it existed
    fn remove_object(&self, source_key: &SourceKey) -> Result<bool>;

    // === Cursor snapshots ===

    /// Load a snapshot generation, folding in later changes not authored by `sync_id`
    fn load_snapshot(&self, sync_id: SyncId, change_id: ChangeId) -> Result<MessageSet>;

    /// Distinct snapshot generations of a session, ascending
    fn snapshot_generations(&self, sync_id: SyncId) -> Result<Vec<ChangeId>>;

    /// Newest snapshot generation of a session
    fn latest_snapshot_generation(&self, sync_id: SyncId) -> Result<Option<ChangeId>> {
        Ok(self.snapshot_generations(sync_id)?.last().copied())
    }

    /// Write one snapshot row per message at `(sync_id, change_id)`
    fn write_snapshot(&self, sync_id: SyncId, change_id: ChangeId, messages: &MessageSet)
    -> Result<()>;

    /// Delete the given generations, returning the number of rows removed
    fn delete_snapshot_generations(
        &self,
        sync_id: SyncId,
        change_ids: &[ChangeId],
    ) -> Result<usize>;

    /// Delete every generation newer than `change_id`
    fn delete_snapshots_after(&self, sync_id: SyncId, change_id: ChangeId) -> Result<usize>;

    /// Delete obsolete generations and write the new one as a single unit
    fn commit_snapshot(&self, commit: &SnapshotCommit<'_>) -> Result<()>;

    /// Add one object to a snapshot generation (no-op if already present)
    fn add_snapshot_entry(
        &self,
        sync_id: SyncId,
        change_id: ChangeId,
        source_key: &SourceKey,
        parent_source_key: &SourceKey,
    ) -> Result<()>;

    /// Remove one object from a snapshot generation, returning whether it was present
    fn remove_snapshot_entry(
        &self,
        sync_id: SyncId,
        change_id: ChangeId,
        source_key: &SourceKey,
    ) -> Result<bool>;

    /// Whether an object is part of a snapshot generation
    fn snapshot_contains(
        &self,
        sync_id: SyncId,
        change_id: ChangeId,
        source_key: &SourceKey,
    ) -> Result<bool>;

    /// Delete snapshot rows of sessions that are not registered
    fn delete_orphaned_snapshots(&self) -> Result<usize>;

    // === Session registry ===

    /// Register a session and return its newly allocated id
    fn register_sync(&self, folder: &SourceKey, kind: SyncKind, at: DateTime<Utc>)
    -> Result<SyncId>;

    /// Get a session registration by id
    fn get_sync(&self, sync_id: SyncId) -> Result<Option<SyncRegistration>>;

    /// Record a session's latest cursor, returning whether the session exists
    fn update_sync(&self, sync_id: SyncId, change_id: ChangeId, at: DateTime<Utc>) -> Result<bool>;

    /// Whether any session is registered on `folder`
    fn is_folder_tracked(&self, folder: &SourceKey) -> Result<bool>;

    /// Delete sessions that last synced before `cutoff`
    fn delete_syncs_idle_since(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
