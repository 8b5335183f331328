//! ICS crate - Incremental content synchronization for a groupware store
//!
//! This crate computes what a client must apply to catch up from its last
//! cursor:
//! - Domain models (SourceKey, ChangeType, MessageSet, SyncFlags)
//! - Storage trait abstractions with SQLite and in-memory backends
//! - Restriction gate boundary for filtered synchronization
//! - Sync orchestration, change recording and session registry
//! - Maintenance of expired sessions and their snapshots

pub mod config;
pub mod error;
pub mod models;
pub mod restriction;
pub mod storage;
pub mod sync;

pub use config::IcsConfig;
pub use error::{IcsError, IcsResult};
pub use models::{
    CandidateRow, ChangeEntry, ChangeId, ChangeRecord, ChangeType, LiveObject, MessageEntry,
    MessageSet, NewChange, SourceKey, SyncFlags, SyncId, SyncKind, SyncRegistration, SyncState,
    change_flags, object_flags,
};
pub use restriction::{Restriction, RestrictionGate, SourceKeyListGate, source_key_restriction};
pub use storage::{
    FullQuery, IncrementalQuery, InMemorySyncStore, SnapshotCommit, SqliteSyncStore, SyncStore,
};
pub use sync::{
    // Content synchronization
    SyncContext, SyncOrchestrator, SyncResponse, get_content_changes,
    // Change recording
    record_change, within_latest_snapshot,
    // Session registry
    register_sync, sync_contents, sync_states,
    // Maintenance
    MaintenanceReport, run_maintenance,
};
