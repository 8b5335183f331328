//! Domain models for the synchronization engine

mod change;
mod message_set;
mod source_key;
mod sync_flags;
mod sync_state;

pub use change::{
    CandidateRow, ChangeEntry, ChangeId, ChangeRecord, ChangeType, LiveObject, NewChange, SyncId,
    change_flags, object_flags,
};
pub use message_set::{MessageEntry, MessageSet};
pub use source_key::SourceKey;
pub use sync_flags::SyncFlags;
pub use sync_state::{SyncKind, SyncRegistration, SyncState};
