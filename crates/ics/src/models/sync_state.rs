//! Sync session registration and cursor state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ChangeId, SourceKey, SyncId};

/// What a registered session synchronizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncKind {
    /// Message contents of one folder
    Contents,
    /// Folder hierarchy below one folder
    Hierarchy,
}

impl SyncKind {
    /// Stored discriminant, matching the groupware server's sync types
    pub fn as_i64(self) -> i64 {
        match self {
            SyncKind::Contents => 1,
            SyncKind::Hierarchy => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(SyncKind::Contents),
            2 => Some(SyncKind::Hierarchy),
            _ => None,
        }
    }
}

/// Last cursor handed to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub sync_id: SyncId,
    pub change_id: ChangeId,
}

/// A registered sync session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRegistration {
    pub sync_id: SyncId,
    /// Folder the session is bound to
    pub folder: SourceKey,
    pub kind: SyncKind,
    /// Cursor returned by the last successful sync, `0` before the first
    pub change_id: ChangeId,
    /// When the session last synced (or registered)
    pub sync_time: DateTime<Utc>,
}

impl SyncRegistration {
    pub fn new(sync_id: SyncId, folder: impl Into<SourceKey>, kind: SyncKind) -> Self {
        Self {
            sync_id,
            folder: folder.into(),
            kind,
            change_id: 0,
            sync_time: Utc::now(),
        }
    }

    /// Record a successful sync at `change_id`
    pub fn record_sync(&mut self, change_id: ChangeId, at: DateTime<Utc>) {
        self.change_id = change_id;
        self.sync_time = at;
    }

    pub fn state(&self) -> SyncState {
        SyncState {
            sync_id: self.sync_id,
            change_id: self.change_id,
        }
    }

    /// Whether the session last synced before `cutoff`
    pub fn idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.sync_time < cutoff
    }
}
