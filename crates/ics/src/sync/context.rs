//! Request and response of one content synchronization

use serde::{Deserialize, Serialize};

use crate::models::{ChangeEntry, ChangeId, SourceKey, SyncFlags, SyncId};
use crate::restriction::Restriction;

/// Everything one synchronization request carries
///
/// Immutable for the duration of an orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncContext {
    /// Folder to synchronize, empty for the whole server (catch-up only)
    pub folder: SourceKey,
    pub sync_id: SyncId,
    /// Cursor the client resumes from, `0` for an initial sync
    pub prior_change_id: ChangeId,
    pub flags: SyncFlags,
    #[serde(default)]
    pub restriction: Option<Restriction>,
    /// Locale for restriction string comparisons
    #[serde(default)]
    pub locale: Option<String>,
}

impl SyncContext {
    pub fn new(folder: impl Into<SourceKey>, sync_id: SyncId, prior_change_id: ChangeId) -> Self {
        Self {
            folder: folder.into(),
            sync_id,
            prior_change_id,
            flags: SyncFlags::all_items(),
            restriction: None,
            locale: None,
        }
    }

    pub fn flags(mut self, flags: SyncFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn restriction(mut self, restriction: impl Into<Option<Restriction>>) -> Self {
        self.restriction = restriction.into();
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn is_initial(&self) -> bool {
        self.prior_change_id == 0
    }

    pub fn is_restricted(&self) -> bool {
        self.restriction.is_some()
    }
}

/// New cursor and the changes the client must apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub new_change_id: ChangeId,
    pub changes: Vec<ChangeEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let ctx = SyncContext::new("F", 4, 0)
            .flags(SyncFlags(SyncFlags::NORMAL))
            .restriction(Restriction::new(serde_json::json!({ "source_keys": [] })))
            .locale("nl_NL");
        assert!(ctx.is_initial());
        assert!(ctx.is_restricted());
        assert_eq!(ctx.locale.as_deref(), Some("nl_NL"));
        assert!(!ctx.restriction(None::<Restriction>).is_restricted());
    }

    #[test]
    fn test_context_from_json() {
        let json = r#"{ "folder": "Rg==", "sync_id": 2, "prior_change_id": 10, "flags": 48 }"#;
        let ctx: SyncContext = serde_json::from_str(json).unwrap();
        assert_eq!(ctx.folder, SourceKey::from("F"));
        assert!(!ctx.is_restricted());
        assert!(ctx.flags.includes_normal());
    }
}
