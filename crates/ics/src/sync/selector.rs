//! Candidate selection
//!
//! Decides which change-log or live-object rows are candidates for
//! reporting to the client.

use anyhow::Context;

use super::SyncContext;
use crate::error::{IcsError, IcsResult};
use crate::models::{CandidateRow, SyncId};
use crate::storage::{FullQuery, IncrementalQuery, SyncStore};

/// Source of candidate rows for one orchestration
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateSelector {
    /// Change-log records after the prior cursor, ascending by change id
    Incremental(IncrementalQuery),
    /// Every live object of the folder paired with its creating change, newest first
    Full(FullQuery),
    /// No candidates at all
    Null,
}

impl CandidateSelector {
    pub fn incremental(ctx: &SyncContext) -> Self {
        CandidateSelector::Incremental(IncrementalQuery {
            folder: ctx.folder.clone(),
            sync_id: ctx.sync_id,
            after_change_id: ctx.prior_change_id,
            flags: ctx.flags,
        })
    }

    /// Full scan of `ctx.folder`, optionally hiding objects created by `exclude_author`
    pub fn full(ctx: &SyncContext, exclude_author: Option<SyncId>) -> IcsResult<Self> {
        if ctx.folder.is_empty() {
            return Err(IcsError::NotSupported(
                "full synchronization requires a folder".to_string(),
            ));
        }
        Ok(CandidateSelector::Full(FullQuery {
            folder: ctx.folder.clone(),
            flags: ctx.flags,
            exclude_author,
        }))
    }

    /// Only valid for server-wide catch-up syncs
    pub fn null(ctx: &SyncContext) -> IcsResult<Self> {
        if !ctx.flags.is_catchup() || !ctx.folder.is_empty() {
            return Err(IcsError::InvalidState(
                "empty candidate set requested outside a server-wide catch-up".to_string(),
            ));
        }
        Ok(CandidateSelector::Null)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CandidateSelector::Incremental(_) => "incremental",
            CandidateSelector::Full(_) => "full",
            CandidateSelector::Null => "null",
        }
    }

    pub fn select(&self, store: &dyn SyncStore) -> IcsResult<Vec<CandidateRow>> {
        let rows = match self {
            CandidateSelector::Incremental(query) => store
                .incremental_candidates(query)
                .context("Failed to select incremental candidates")?,
            CandidateSelector::Full(query) => store
                .full_candidates(query)
                .context("Failed to select live objects")?,
            CandidateSelector::Null => Vec::new(),
        };
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeType, LiveObject, NewChange, SourceKey, SyncFlags};
    use crate::restriction::source_key_restriction;
    use crate::storage::InMemorySyncStore;

    #[test]
    fn test_full_requires_folder() {
        let ctx = SyncContext::new(SourceKey::empty(), 1, 0);
        let err = CandidateSelector::full(&ctx, None).unwrap_err();
        assert!(matches!(err, IcsError::NotSupported(_)));
    }

    #[test]
    fn test_null_preconditions() {
        let catchup = SyncFlags::all_items().with(SyncFlags::CATCHUP);
        let ctx = SyncContext::new(SourceKey::empty(), 1, 0).flags(catchup);
        assert_eq!(CandidateSelector::null(&ctx).unwrap(), CandidateSelector::Null);

        let scoped = SyncContext::new("F", 1, 0).flags(catchup);
        assert!(CandidateSelector::null(&scoped).is_err());

        // A restriction does not change the server-wide catch-up selection
        let restricted = ctx
            .clone()
            .restriction(source_key_restriction(Vec::<&SourceKey>::new()));
        assert_eq!(CandidateSelector::null(&restricted).unwrap(), CandidateSelector::Null);

        let no_catchup = SyncContext::new(SourceKey::empty(), 1, 0);
        assert!(CandidateSelector::null(&no_catchup).is_err());
    }

    #[test]
    fn test_select() {
        let store = InMemorySyncStore::new();
        store.put_object(&LiveObject::new("A", "F")).unwrap();
        store
            .append_change(&NewChange::new("A", "F", ChangeType::MESSAGE_NEW))
            .unwrap();

        let ctx = SyncContext::new("F", 2, 0);
        let full = CandidateSelector::full(&ctx, Some(2)).unwrap();
        assert_eq!(full.select(&store).unwrap().len(), 1);
        assert_eq!(full.name(), "full");

        let incremental = CandidateSelector::incremental(&ctx);
        let rows = incremental.select(&store).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].change_type, ChangeType::MESSAGE_NEW);

        assert!(CandidateSelector::Null.select(&store).unwrap().is_empty());
    }
}
