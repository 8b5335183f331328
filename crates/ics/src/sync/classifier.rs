//! Change classification
//!
//! Turns candidate rows into the change types reported to the client. One
//! classifier serves one orchestration and owns whatever working state it
//! needs (the legacy snapshot for [`LegacyClassifier`]).

use crate::error::{IcsError, IcsResult};
use crate::models::{CandidateRow, ChangeId, ChangeType, MessageSet, SyncId};

/// Outcome of classifying an accepted row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    pub change_type: ChangeType,
    pub flags: u32,
}

impl Classified {
    fn new(change_type: ChangeType, flags: u32) -> Self {
        Self { change_type, flags }
    }

    /// Only flag changes and incremental pass-through carry flags
    fn bare(change_type: ChangeType) -> Self {
        Self::new(change_type, 0)
    }

    fn hard_delete() -> Self {
        Self::bare(ChangeType::MESSAGE_HARD_DELETE)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeClassifier {
    /// Initial sync: everything live is new
    FirstSync { max_change_id: ChangeId },
    /// Unrestricted resume over the change log, rows pass through
    NonLegacyIncremental { max_change_id: ChangeId },
    /// Unrestricted prior sync moving to a restricted one
    NonLegacyFull(NonLegacyFullClassifier),
    /// Prior sync was restricted and left a snapshot
    Legacy(LegacyClassifier),
}

impl ChangeClassifier {
    pub fn first_sync(folder_max: ChangeId) -> Self {
        ChangeClassifier::FirstSync {
            max_change_id: folder_max,
        }
    }

    pub fn non_legacy_incremental(folder_max: ChangeId) -> Self {
        ChangeClassifier::NonLegacyIncremental {
            max_change_id: folder_max,
        }
    }

    pub fn non_legacy_full(sync_id: SyncId, prior_change_id: ChangeId) -> Self {
        ChangeClassifier::NonLegacyFull(NonLegacyFullClassifier::new(sync_id, prior_change_id))
    }

    pub fn legacy(
        legacy: MessageSet,
        sync_id: SyncId,
        prior_change_id: ChangeId,
        folder_max: ChangeId,
    ) -> Self {
        ChangeClassifier::Legacy(LegacyClassifier::new(
            legacy,
            sync_id,
            prior_change_id,
            folder_max,
        ))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChangeClassifier::FirstSync { .. } => "first-sync",
            ChangeClassifier::NonLegacyIncremental { .. } => "non-legacy-incremental",
            ChangeClassifier::NonLegacyFull(_) => "non-legacy-full",
            ChangeClassifier::Legacy(_) => "legacy",
        }
    }

    /// Classify a row the restriction accepted (or any row when unrestricted)
    ///
    /// `None` means the row is a no-op and must not be reported.
    pub fn process_accepted(&mut self, row: &CandidateRow) -> IcsResult<Option<Classified>> {
        match self {
            ChangeClassifier::FirstSync { .. } => {
                if row.is_deleted() {
                    return Ok(None);
                }
                Ok(Some(Classified::bare(ChangeType::MESSAGE_NEW)))
            }
            ChangeClassifier::NonLegacyIncremental { .. } => {
                Ok(Some(Classified::new(row.change_type, row.change_flags)))
            }
            ChangeClassifier::NonLegacyFull(classifier) => Ok(classifier.process_accepted(row)),
            ChangeClassifier::Legacy(classifier) => Ok(classifier.process_accepted(row)),
        }
    }

    /// Classify a row the restriction rejected
    pub fn process_rejected(&mut self, row: &CandidateRow) -> IcsResult<Option<ChangeType>> {
        match self {
            ChangeClassifier::FirstSync { .. } => Ok(None),
            ChangeClassifier::NonLegacyIncremental { .. } => Err(IcsError::InvalidState(format!(
                "row {} rejected by a restriction during an unrestricted incremental sync",
                row.source_key
            ))),
            ChangeClassifier::NonLegacyFull(classifier) => {
                classifier.observe(row.change_id);
                Ok(None)
            }
            ChangeClassifier::Legacy(classifier) => Ok(classifier.process_rejected(row)),
        }
    }

    /// Legacy entries never confirmed by a candidate row. Drains the set.
    pub fn residuals(&mut self) -> MessageSet {
        match self {
            ChangeClassifier::Legacy(classifier) => std::mem::take(&mut classifier.legacy),
            _ => MessageSet::new(),
        }
    }

    /// Cursor to hand back, before finalize adjustments
    pub fn max_change_id(&self) -> ChangeId {
        match self {
            ChangeClassifier::FirstSync { max_change_id }
            | ChangeClassifier::NonLegacyIncremental { max_change_id } => *max_change_id,
            ChangeClassifier::NonLegacyFull(classifier) => classifier.max_change_id,
            ChangeClassifier::Legacy(classifier) => classifier.max_change_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonLegacyFullClassifier {
    sync_id: SyncId,
    prior_change_id: ChangeId,
    max_change_id: ChangeId,
}

impl NonLegacyFullClassifier {
    pub fn new(sync_id: SyncId, prior_change_id: ChangeId) -> Self {
        Self {
            sync_id,
            prior_change_id,
            max_change_id: prior_change_id,
        }
    }

    fn observe(&mut self, change_id: ChangeId) {
        self.max_change_id = self.max_change_id.max(change_id);
    }

    fn process_accepted(&mut self, row: &CandidateRow) -> Option<Classified> {
        self.observe(row.change_id);

        if row.is_deleted() && row.change_id <= self.prior_change_id {
            return Some(Classified::hard_delete());
        }
        let foreign = row.source_sync == 0 || row.source_sync != self.sync_id;
        if row.change_id > self.prior_change_id && foreign {
            return Some(Classified::bare(ChangeType::MESSAGE_NEW));
        }
        None
    }
}

/// Diffs candidates against the snapshot the client's prior sync left
///
/// Every matched entry is consumed. What remains at the end are residuals.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyClassifier {
    legacy: MessageSet,
    sync_id: SyncId,
    folder_max: ChangeId,
    max_change_id: ChangeId,
}

impl LegacyClassifier {
    pub fn new(
        mut legacy: MessageSet,
        sync_id: SyncId,
        prior_change_id: ChangeId,
        folder_max: ChangeId,
    ) -> Self {
        // A restriction that matched nothing leaves only the sentinel
        if legacy.is_sentinel_only() {
            legacy.clear();
        }
        Self {
            legacy,
            sync_id,
            folder_max,
            max_change_id: prior_change_id,
        }
    }

    fn produced(&mut self) {
        self.max_change_id = self.max_change_id.max(self.folder_max);
    }

    fn process_accepted(&mut self, row: &CandidateRow) -> Option<Classified> {
        let classified = match self.legacy.remove(&row.source_key) {
            None => {
                let own = row.source_sync != 0 && row.source_sync == self.sync_id;
                if row.is_deleted() || own {
                    None
                } else {
                    Some(Classified::bare(ChangeType::MESSAGE_NEW))
                }
            }
            Some(_) if row.is_deleted() => Some(Classified::hard_delete()),
            Some(entry) if entry.has_content_change() => {
                Some(Classified::bare(ChangeType::MESSAGE_CHANGE))
            }
            Some(entry) if entry.has_flag_change() => {
                Some(Classified::new(ChangeType::MESSAGE_FLAG, entry.flags))
            }
            Some(_) => None,
        };
        if classified.is_some() {
            self.produced();
        }
        classified
    }

    fn process_rejected(&mut self, row: &CandidateRow) -> Option<ChangeType> {
        self.legacy.remove(&row.source_key)?;
        self.produced();
        Some(ChangeType::MESSAGE_HARD_DELETE)
    }
}
