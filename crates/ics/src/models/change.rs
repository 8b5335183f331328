//! Change-log records and the change entries reported to clients

use serde::{Deserialize, Serialize};
use std::fmt;

use super::SourceKey;

/// Server-wide change-log id. Monotonically increasing, never reused.
pub type ChangeId = u64;

/// Identifier of a registered synchronization session. `0` means the
/// change originated on the server itself rather than from a client.
pub type SyncId = u64;

/// Change type bitset: a category bit plus an action in the low nibble
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeType(pub u32);

impl ChangeType {
    pub const MESSAGE: u32 = 0x1000;
    pub const FOLDER: u32 = 0x2000;
    pub const ACTION_MASK: u32 = 0x000F;

    pub const NEW: u32 = 0x0001;
    pub const CHANGE: u32 = 0x0002;
    pub const FLAG: u32 = 0x0003;
    pub const SOFT_DELETE: u32 = 0x0004;
    pub const HARD_DELETE: u32 = 0x0005;

    pub const MESSAGE_NEW: ChangeType = ChangeType(Self::MESSAGE | Self::NEW);
    pub const MESSAGE_CHANGE: ChangeType = ChangeType(Self::MESSAGE | Self::CHANGE);
    pub const MESSAGE_FLAG: ChangeType = ChangeType(Self::MESSAGE | Self::FLAG);
    pub const MESSAGE_SOFT_DELETE: ChangeType = ChangeType(Self::MESSAGE | Self::SOFT_DELETE);
    pub const MESSAGE_HARD_DELETE: ChangeType = ChangeType(Self::MESSAGE | Self::HARD_DELETE);

    pub const FOLDER_NEW: ChangeType = ChangeType(Self::FOLDER | Self::NEW);
    pub const FOLDER_CHANGE: ChangeType = ChangeType(Self::FOLDER | Self::CHANGE);
    pub const FOLDER_SOFT_DELETE: ChangeType = ChangeType(Self::FOLDER | Self::SOFT_DELETE);
    pub const FOLDER_HARD_DELETE: ChangeType = ChangeType(Self::FOLDER | Self::HARD_DELETE);

    /// Type of the private cursor-bump marker. Carries no category bit so
    /// no selector ever reports it.
    pub const MARKER: ChangeType = ChangeType(0);

    pub fn action(self) -> u32 {
        self.0 & Self::ACTION_MASK
    }

    pub fn is_message(self) -> bool {
        self.0 & Self::MESSAGE != 0
    }

    pub fn is_delete(self) -> bool {
        matches!(self.action(), Self::SOFT_DELETE | Self::HARD_DELETE)
    }

    /// Bit recorded in a snapshot entry's accumulated change flags
    pub fn action_bit(self) -> u32 {
        1 << self.action()
    }

    /// Whether this is one of the change types the log accepts
    pub fn is_recordable(self) -> bool {
        matches!(
            self,
            Self::MESSAGE_NEW
                | Self::MESSAGE_CHANGE
                | Self::MESSAGE_FLAG
                | Self::MESSAGE_SOFT_DELETE
                | Self::MESSAGE_HARD_DELETE
                | Self::FOLDER_NEW
                | Self::FOLDER_CHANGE
                | Self::FOLDER_SOFT_DELETE
                | Self::FOLDER_HARD_DELETE
        )
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Accumulated change flags of a snapshot entry (`1 << action`)
pub mod change_flags {
    use super::ChangeType;

    pub const NEW: u32 = 1 << ChangeType::NEW;
    pub const CHANGE: u32 = 1 << ChangeType::CHANGE;
    pub const FLAG: u32 = 1 << ChangeType::FLAG;
    pub const SOFT_DELETE: u32 = 1 << ChangeType::SOFT_DELETE;
    pub const HARD_DELETE: u32 = 1 << ChangeType::HARD_DELETE;
}

/// Flags mirrored from a live object
pub mod object_flags {
    pub const READ: u32 = 0x0001;
    pub const ASSOCIATED: u32 = 0x0040;
    pub const DELETED: u32 = 0x0400;
}

/// One row of the append-only change log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub id: ChangeId,
    pub source_key: SourceKey,
    pub parent_source_key: SourceKey,
    pub change_type: ChangeType,
    /// Object flags at change time (associated marker, read state)
    pub flags: u32,
    /// Session that caused the change, `0` for server-side changes
    pub source_sync: SyncId,
}

/// A change about to be appended to the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChange {
    pub source_key: SourceKey,
    pub parent_source_key: SourceKey,
    pub change_type: ChangeType,
    pub flags: u32,
    pub source_sync: SyncId,
}

impl NewChange {
    pub fn new(
        source_key: impl Into<SourceKey>,
        parent_source_key: impl Into<SourceKey>,
        change_type: ChangeType,
    ) -> Self {
        Self {
            source_key: source_key.into(),
            parent_source_key: parent_source_key.into(),
            change_type,
            flags: 0,
            source_sync: 0,
        }
    }

    /// Private cursor-bump record in `folder`, never reported to clients
    pub fn marker(folder: &SourceKey, sync_id: SyncId) -> Self {
        Self {
            source_key: SourceKey::sentinel(),
            parent_source_key: folder.clone(),
            change_type: ChangeType::MARKER,
            flags: 0,
            source_sync: sync_id,
        }
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn authored_by(mut self, sync_id: SyncId) -> Self {
        self.source_sync = sync_id;
        self
    }
}

/// A currently-stored message-class object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveObject {
    pub source_key: SourceKey,
    pub parent_source_key: SourceKey,
    pub flags: u32,
}

impl LiveObject {
    pub fn new(source_key: impl Into<SourceKey>, parent_source_key: impl Into<SourceKey>) -> Self {
        Self {
            source_key: source_key.into(),
            parent_source_key: parent_source_key.into(),
            flags: 0,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }
}

/// A row produced by a candidate selector
///
/// Incremental rows come straight from the change log. Full rows are live
/// objects correlated with their newest `MESSAGE_NEW` record, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRow {
    /// Change-log id, `0` when no record is associated (objects older than the log)
    pub change_id: ChangeId,
    pub source_key: SourceKey,
    pub parent_source_key: SourceKey,
    pub change_type: ChangeType,
    /// Flags stored on the change record
    pub change_flags: u32,
    /// Flags of the live object, present for full-scan rows only
    pub object_flags: Option<u32>,
    /// Author of the associated change record, `0` when none
    pub source_sync: SyncId,
}

impl CandidateRow {
    pub fn is_deleted(&self) -> bool {
        self.object_flags
            .is_some_and(|flags| flags & object_flags::DELETED != 0)
    }
}

/// One change reported back to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Change-log id the entry derives from, `0` for synthesized deletions
    pub change_id: ChangeId,
    pub source_key: SourceKey,
    pub parent_source_key: SourceKey,
    pub change_type: ChangeType,
    pub flags: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_and_category() {
        assert_eq!(ChangeType::MESSAGE_FLAG.action(), ChangeType::FLAG);
        assert!(ChangeType::MESSAGE_FLAG.is_message());
        assert!(!ChangeType::FOLDER_NEW.is_message());
        assert!(!ChangeType::MARKER.is_message());
    }

    #[test]
    fn test_is_delete() {
        assert!(ChangeType::MESSAGE_SOFT_DELETE.is_delete());
        assert!(ChangeType::MESSAGE_HARD_DELETE.is_delete());
        assert!(!ChangeType::MESSAGE_CHANGE.is_delete());
    }

    #[test]
    fn test_action_bit() {
        assert_eq!(ChangeType::MESSAGE_NEW.action_bit(), change_flags::NEW);
        assert_eq!(ChangeType::MESSAGE_FLAG.action_bit(), change_flags::FLAG);
    }

    #[test]
    fn test_is_recordable() {
        assert!(ChangeType::MESSAGE_NEW.is_recordable());
        assert!(ChangeType::FOLDER_HARD_DELETE.is_recordable());
        assert!(!ChangeType::MARKER.is_recordable());
        assert!(!ChangeType(ChangeType::MESSAGE | 0x6).is_recordable());
        assert!(!ChangeType(ChangeType::MESSAGE | ChangeType::FOLDER | 1).is_recordable());
    }

    #[test]
    fn test_candidate_deleted_flag() {
        let mut row = CandidateRow {
            change_id: 0,
            source_key: SourceKey::from("A"),
            parent_source_key: SourceKey::from("F"),
            change_type: ChangeType::MESSAGE_NEW,
            change_flags: 0,
            object_flags: None,
            source_sync: 0,
        };
        assert!(!row.is_deleted());
        row.object_flags = Some(object_flags::DELETED | object_flags::READ);
        assert!(row.is_deleted());
    }

    #[test]
    fn test_new_change_builder() {
        let change = NewChange::new("A", "F", ChangeType::MESSAGE_FLAG)
            .flags(object_flags::READ)
            .authored_by(7);
        assert_eq!(change.flags, object_flags::READ);
        assert_eq!(change.source_sync, 7);
    }

    #[test]
    fn test_marker_is_not_reportable() {
        let marker = NewChange::marker(&SourceKey::from("F"), 3);
        assert!(marker.source_key.is_sentinel());
        assert_eq!(marker.parent_source_key, SourceKey::from("F"));
        assert!(!marker.change_type.is_message());
        assert!(!marker.change_type.is_recordable());
    }
}
