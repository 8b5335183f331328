//! Client-supplied synchronization flags

use serde::{Deserialize, Serialize};

use super::{ChangeType, object_flags};

/// Flags passed verbatim by the RPC layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncFlags(pub u32);

impl SyncFlags {
    pub const NO_DELETIONS: u32 = 0x0002;
    pub const NO_SOFT_DELETIONS: u32 = 0x0004;
    /// Include read-state-only changes
    pub const READ_STATE: u32 = 0x0008;
    /// Include associated (hidden) items
    pub const ASSOCIATED: u32 = 0x0010;
    /// Include normal items
    pub const NORMAL: u32 = 0x0020;
    /// Client only wants its cursor advanced
    pub const CATCHUP: u32 = 0x0400;

    /// Normal and associated items, read state included
    pub fn all_items() -> Self {
        Self(Self::NORMAL | Self::ASSOCIATED | Self::READ_STATE)
    }

    pub fn with(self, bits: u32) -> Self {
        Self(self.0 | bits)
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn includes_associated(self) -> bool {
        self.contains(Self::ASSOCIATED)
    }

    pub fn includes_normal(self) -> bool {
        self.contains(Self::NORMAL)
    }

    pub fn suppresses_deletions(self) -> bool {
        self.contains(Self::NO_DELETIONS)
    }

    pub fn suppresses_soft_deletions(self) -> bool {
        self.contains(Self::NO_SOFT_DELETIONS)
    }

    pub fn suppresses_read_state(self) -> bool {
        !self.contains(Self::READ_STATE)
    }

    pub fn is_catchup(self) -> bool {
        self.contains(Self::CATCHUP)
    }

    /// Whether an item carrying `flags` belongs to the requested item classes
    pub fn admits_item(self, flags: u32) -> bool {
        let associated = flags & object_flags::ASSOCIATED != 0;
        (!associated || self.includes_associated()) && (associated || self.includes_normal())
    }

    /// Whether a change of this kind survives the suppression flags
    pub fn admits_action(self, change_type: ChangeType) -> bool {
        match change_type.action() {
            ChangeType::SOFT_DELETE => {
                !self.suppresses_deletions() && !self.suppresses_soft_deletions()
            }
            ChangeType::HARD_DELETE => !self.suppresses_deletions(),
            ChangeType::FLAG => !self.suppresses_read_state(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_suppresses_read_state() {
        let flags = SyncFlags::default();
        assert!(flags.suppresses_read_state());
        assert!(!flags.includes_normal());
        assert!(!flags.includes_associated());
    }

    #[test]
    fn test_all_items() {
        let flags = SyncFlags::all_items();
        assert!(flags.includes_normal());
        assert!(flags.includes_associated());
        assert!(!flags.suppresses_read_state());
        assert!(!flags.is_catchup());
    }

    #[test]
    fn test_with() {
        let flags = SyncFlags::all_items().with(SyncFlags::CATCHUP | SyncFlags::NO_DELETIONS);
        assert!(flags.is_catchup());
        assert!(flags.suppresses_deletions());
        assert!(!flags.suppresses_soft_deletions());
    }

    #[test]
    fn test_admits_item() {
        let normal_only = SyncFlags(SyncFlags::NORMAL);
        assert!(normal_only.admits_item(object_flags::READ));
        assert!(!normal_only.admits_item(object_flags::ASSOCIATED));

        let associated_only = SyncFlags(SyncFlags::ASSOCIATED);
        assert!(associated_only.admits_item(object_flags::ASSOCIATED));
        assert!(!associated_only.admits_item(0));

        assert!(SyncFlags::all_items().admits_item(0));
        assert!(SyncFlags::all_items().admits_item(object_flags::ASSOCIATED));
    }

    #[test]
    fn test_admits_action() {
        let flags = SyncFlags::all_items();
        assert!(flags.admits_action(ChangeType::MESSAGE_SOFT_DELETE));
        assert!(flags.admits_action(ChangeType::MESSAGE_FLAG));

        let no_soft = flags.with(SyncFlags::NO_SOFT_DELETIONS);
        assert!(!no_soft.admits_action(ChangeType::MESSAGE_SOFT_DELETE));
        assert!(no_soft.admits_action(ChangeType::MESSAGE_HARD_DELETE));

        let no_deletes = flags.with(SyncFlags::NO_DELETIONS);
        assert!(!no_deletes.admits_action(ChangeType::MESSAGE_SOFT_DELETE));
        assert!(!no_deletes.admits_action(ChangeType::MESSAGE_HARD_DELETE));
        assert!(no_deletes.admits_action(ChangeType::MESSAGE_NEW));

        let no_read_state = SyncFlags(SyncFlags::NORMAL);
        assert!(!no_read_state.admits_action(ChangeType::MESSAGE_FLAG));
        assert!(no_read_state.admits_action(ChangeType::MESSAGE_CHANGE));
    }
}
