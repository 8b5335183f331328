//! In-memory view of a cursor snapshot

use std::collections::BTreeMap;
use std::collections::btree_map;

use super::{ChangeType, SourceKey, change_flags};

/// What a session believed about one object at a snapshot generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    pub parent_source_key: SourceKey,
    /// OR of `1 << action` for changes seen since the snapshot was taken
    pub change_types: u32,
    /// Flags of the newest flag-only change, reported with `MESSAGE_FLAG`
    pub flags: u32,
}

impl MessageEntry {
    pub fn new(parent_source_key: SourceKey) -> Self {
        Self {
            parent_source_key,
            change_types: 0,
            flags: 0,
        }
    }

    /// Fold a later change into the entry
    pub fn accumulate(&mut self, change_type: ChangeType, flags: u32) {
        self.change_types |= change_type.action_bit();
        if change_type.action() == ChangeType::FLAG {
            self.flags = flags;
        }
    }

    /// Content changed (or the object was re-created) since the snapshot
    pub fn has_content_change(&self) -> bool {
        self.change_types & (change_flags::NEW | change_flags::CHANGE) != 0
    }

    pub fn has_flag_change(&self) -> bool {
        self.change_types & change_flags::FLAG != 0
    }
}

/// Source key to snapshot entry, ordered bytewise by source key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSet {
    entries: BTreeMap<SourceKey, MessageEntry>,
}

impl MessageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set holding only the "restriction matched nothing" sentinel
    pub fn sentinel(folder: &SourceKey) -> Self {
        let mut set = Self::new();
        set.insert(SourceKey::sentinel(), MessageEntry::new(folder.clone()));
        set
    }

    /// True when the set is exactly the sentinel marker
    pub fn is_sentinel_only(&self) -> bool {
        self.entries.len() == 1 && self.entries.keys().all(SourceKey::is_sentinel)
    }

    pub fn insert(&mut self, key: SourceKey, entry: MessageEntry) -> Option<MessageEntry> {
        self.entries.insert(key, entry)
    }

    pub fn entry(&mut self, key: SourceKey) -> btree_map::Entry<'_, SourceKey, MessageEntry> {
        self.entries.entry(key)
    }

    pub fn get(&self, key: &SourceKey) -> Option<&MessageEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &SourceKey) -> Option<&mut MessageEntry> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &SourceKey) -> Option<MessageEntry> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &SourceKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> btree_map::Iter<'_, SourceKey, MessageEntry> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SourceKey> {
        self.entries.keys()
    }
}

impl IntoIterator for MessageSet {
    type Item = (SourceKey, MessageEntry);
    type IntoIter = btree_map::IntoIter<SourceKey, MessageEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(SourceKey, MessageEntry)> for MessageSet {
    fn from_iter<I: IntoIterator<Item = (SourceKey, MessageEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> SourceKey {
        SourceKey::from(s)
    }

    #[test]
    fn test_sentinel_only() {
        let folder = key("F");
        assert!(MessageSet::sentinel(&folder).is_sentinel_only());
        assert!(!MessageSet::new().is_sentinel_only());

        let mut set = MessageSet::sentinel(&folder);
        set.insert(key("A"), MessageEntry::new(folder));
        assert!(!set.is_sentinel_only());
    }

    #[test]
    fn test_accumulate_content_change() {
        let mut entry = MessageEntry::new(key("F"));
        assert!(!entry.has_content_change());
        entry.accumulate(ChangeType::MESSAGE_CHANGE, 0);
        assert!(entry.has_content_change());
        assert!(!entry.has_flag_change());
    }

    #[test]
    fn test_accumulate_keeps_latest_flags() {
        let mut entry = MessageEntry::new(key("F"));
        entry.accumulate(ChangeType::MESSAGE_FLAG, 1);
        entry.accumulate(ChangeType::MESSAGE_CHANGE, 0x40);
        entry.accumulate(ChangeType::MESSAGE_FLAG, 0);
        assert!(entry.has_flag_change());
        assert!(entry.has_content_change());
        assert_eq!(entry.flags, 0);
    }

    #[test]
    fn test_iteration_is_ordered() {
        let folder = key("F");
        let set: MessageSet = ["C", "A", "B"]
            .into_iter()
            .map(|k| (key(k), MessageEntry::new(folder.clone())))
            .collect();
        let keys: Vec<_> = set.keys().cloned().collect();
        assert_eq!(keys, vec![key("A"), key("B"), key("C")]);
    }
}
