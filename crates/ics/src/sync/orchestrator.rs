//! Content synchronization pipeline
//!
//! One [`SyncOrchestrator`] serves exactly one request:
//!
//! 1. **Init**: freeze the folder's max change id and pick the selector and
//!    classifier for the cursor/restriction combination
//! 2. **Select**: gather candidate rows
//! 3. **Classify**: evaluate the restriction in batches and turn candidates
//!    into change entries, then retract residual legacy entries
//! 4. **Finalize**: pick the new cursor and persist the next snapshot
//!
//! Nothing is written before finalize, so a failed orchestration leaves the
//! client's cursor valid for a retry.

use anyhow::Context;
use log::{debug, info};
use std::collections::HashSet;

use super::compaction::obsolete_generations;
use super::{CandidateSelector, ChangeClassifier, SyncContext, SyncResponse};
use crate::config::IcsConfig;
use crate::error::{IcsError, IcsResult};
use crate::models::{
    CandidateRow, ChangeEntry, ChangeId, ChangeType, MessageEntry, MessageSet, NewChange,
    SourceKey, change_flags,
};
use crate::restriction::RestrictionGate;
use crate::storage::{SnapshotCommit, SyncStore};

/// Pipeline stage, strictly advancing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Created,
    Initialized,
    Selected,
    Classified,
    Finalized,
}

pub struct SyncOrchestrator<'a> {
    store: &'a dyn SyncStore,
    gate: &'a dyn RestrictionGate,
    config: &'a IcsConfig,
    ctx: SyncContext,
    stage: Stage,
    folder_max: ChangeId,
    selector: Option<CandidateSelector>,
    classifier: Option<ChangeClassifier>,
    /// The loaded snapshot had no rows at all (a sentinel counts as a row)
    legacy_loaded_empty: bool,
    legacy_len: usize,
    candidates: Vec<CandidateRow>,
    changes: Vec<ChangeEntry>,
    new_messages: MessageSet,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(
        store: &'a dyn SyncStore,
        gate: &'a dyn RestrictionGate,
        config: &'a IcsConfig,
        ctx: SyncContext,
    ) -> Self {
        Self {
            store,
            gate,
            config,
            ctx,
            stage: Stage::Created,
            folder_max: 0,
            selector: None,
            classifier: None,
            legacy_loaded_empty: true,
            legacy_len: 0,
            candidates: Vec::new(),
            changes: Vec::new(),
            new_messages: MessageSet::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    fn expect_stage(&self, expected: Stage) -> IcsResult<()> {
        if self.stage != expected {
            return Err(IcsError::InvalidState(format!(
                "orchestrator is {:?}, expected {:?}",
                self.stage, expected
            )));
        }
        Ok(())
    }

    /// Choose the selector and classifier for this request
    pub fn init(&mut self) -> IcsResult<()> {
        self.expect_stage(Stage::Created)?;
        let ctx = &self.ctx;

        if ctx.is_initial() && ctx.folder.is_empty() && !ctx.flags.is_catchup() {
            return Err(IcsError::NotSupported(
                "initial synchronization of the whole server requires catch-up".to_string(),
            ));
        }

        let folder_max = self
            .store
            .max_change_id(&ctx.folder)
            .context("Failed to read folder max change id")?;
        // The cursor never moves backwards, whatever the folder holds now
        self.folder_max = folder_max.max(ctx.prior_change_id);

        let (selector, classifier) = if ctx.is_initial() {
            let classifier = ChangeClassifier::first_sync(self.folder_max);
            if ctx.folder.is_empty() {
                (CandidateSelector::null(ctx)?, classifier)
            } else {
                let exclude_author = (ctx.sync_id != 0).then_some(ctx.sync_id);
                (CandidateSelector::full(ctx, exclude_author)?, classifier)
            }
        } else {
            let legacy = self
                .store
                .load_snapshot(ctx.sync_id, ctx.prior_change_id)
                .context("Failed to load cursor snapshot")?;
            self.legacy_loaded_empty = legacy.is_empty();
            self.legacy_len = legacy.len();

            if legacy.is_empty() && !ctx.is_restricted() {
                (
                    CandidateSelector::incremental(ctx),
                    ChangeClassifier::non_legacy_incremental(self.folder_max),
                )
            } else if legacy.is_empty() {
                (
                    CandidateSelector::full(ctx, None)?,
                    ChangeClassifier::non_legacy_full(ctx.sync_id, ctx.prior_change_id),
                )
            } else {
                (
                    CandidateSelector::full(ctx, None)?,
                    ChangeClassifier::legacy(
                        legacy,
                        ctx.sync_id,
                        ctx.prior_change_id,
                        self.folder_max,
                    ),
                )
            }
        };

        debug!(
            "Sync {} of folder {} from {}: {} selector, {} classifier (folder max {})",
            ctx.sync_id,
            ctx.folder,
            ctx.prior_change_id,
            selector.name(),
            classifier.name(),
            self.folder_max
        );

        self.selector = Some(selector);
        self.classifier = Some(classifier);
        self.stage = Stage::Initialized;
        Ok(())
    }

    /// Gather candidate rows
    pub fn select(&mut self) -> IcsResult<()> {
        self.expect_stage(Stage::Initialized)?;
        let selector = self
            .selector
            .as_ref()
            .ok_or_else(|| IcsError::InvalidState("no selector chosen".to_string()))?;

        self.candidates = selector.select(self.store)?;
        self.changes = Vec::with_capacity(self.candidates.len() + self.legacy_len);

        debug!(
            "Sync {}: {} candidates from {} selector",
            self.ctx.sync_id,
            self.candidates.len(),
            selector.name()
        );
        self.stage = Stage::Selected;
        Ok(())
    }

    /// Source keys of the candidates matching the restriction, if any
    fn matching_candidates(&self) -> IcsResult<Option<HashSet<SourceKey>>> {
        let Some(restriction) = self.ctx.restriction.as_ref() else {
            return Ok(None);
        };
        let locale = self
            .ctx
            .locale
            .as_deref()
            .unwrap_or(&self.config.restriction_locale);

        let mut matches = HashSet::new();
        for batch in self.candidates.chunks(self.config.batch_size()) {
            let keys: Vec<SourceKey> = batch.iter().map(|row| row.source_key.clone()).collect();
            matches.extend(self.gate.evaluate(&keys, restriction, locale)?);
        }
        Ok(Some(matches))
    }

    /// Turn candidates into change entries, then retract residuals
    pub fn classify(&mut self) -> IcsResult<()> {
        self.expect_stage(Stage::Selected)?;
        let matches = self.matching_candidates()?;
        let restricted = matches.is_some();

        let mut classifier = self
            .classifier
            .take()
            .ok_or_else(|| IcsError::InvalidState("no classifier chosen".to_string()))?;
        let candidates = std::mem::take(&mut self.candidates);

        for row in &candidates {
            if row.source_key.is_empty() {
                return Err(IcsError::InvalidState(format!(
                    "candidate row {} has no source key",
                    row.change_id
                )));
            }

            let accepted = matches
                .as_ref()
                .is_none_or(|matches| matches.contains(&row.source_key));

            let classified = if accepted {
                if restricted {
                    let mut entry = MessageEntry::new(row.parent_source_key.clone());
                    entry.change_types = change_flags::NEW;
                    entry.flags = row.object_flags.unwrap_or(row.change_flags);
                    self.new_messages.insert(row.source_key.clone(), entry);
                }
                classifier
                    .process_accepted(row)?
                    .map(|c| (c.change_type, c.flags))
            } else {
                classifier.process_rejected(row)?.map(|t| (t, 0))
            };

            let Some((change_type, flags)) = classified else {
                continue;
            };
            if change_type == ChangeType::MARKER {
                continue;
            }
            self.changes.push(ChangeEntry {
                change_id: row.change_id,
                source_key: row.source_key.clone(),
                parent_source_key: row.parent_source_key.clone(),
                change_type,
                flags,
            });
        }

        let residuals = classifier.residuals();
        let mut retracted = 0;
        for (source_key, entry) in residuals {
            if source_key.is_sentinel() {
                continue;
            }
            self.changes.push(ChangeEntry {
                change_id: 0,
                source_key,
                parent_source_key: entry.parent_source_key,
                change_type: ChangeType::MESSAGE_HARD_DELETE,
                flags: 0,
            });
            retracted += 1;
        }

        debug!(
            "Sync {}: {} changes from {} candidates ({} residual deletions)",
            self.ctx.sync_id,
            self.changes.len(),
            candidates.len(),
            retracted
        );

        self.classifier = Some(classifier);
        self.stage = Stage::Classified;
        Ok(())
    }

    /// Pick the new cursor and persist the next snapshot
    pub fn finalize(&mut self) -> IcsResult<SyncResponse> {
        self.expect_stage(Stage::Classified)?;
        let classifier = self
            .classifier
            .as_ref()
            .ok_or_else(|| IcsError::InvalidState("no classifier chosen".to_string()))?;
        let ctx = &self.ctx;
        let mut max_change = classifier.max_change_id();

        let restriction_transition = self.legacy_loaded_empty && ctx.is_restricted();
        if self.changes.is_empty() && !ctx.is_initial() && !restriction_transition {
            let discarded = self
                .store
                .delete_snapshots_after(ctx.sync_id, ctx.prior_change_id)
                .context("Failed to discard newer snapshot generations")?;
            debug!(
                "Sync {}: no changes since {}, discarded {} snapshot rows",
                ctx.sync_id, ctx.prior_change_id, discarded
            );
            self.stage = Stage::Finalized;
            return Ok(SyncResponse {
                new_change_id: max_change,
                changes: Vec::new(),
            });
        }

        if max_change == ctx.prior_change_id {
            max_change = self
                .store
                .append_change(&NewChange::marker(&ctx.folder, ctx.sync_id))
                .context("Failed to write cursor marker")?;
            debug!(
                "Sync {}: no log progress past {}, marker {} written",
                ctx.sync_id, ctx.prior_change_id, max_change
            );
        }

        if ctx.is_restricted() && self.new_messages.is_empty() {
            self.new_messages = MessageSet::sentinel(&ctx.folder);
        }

        let generations = self
            .store
            .snapshot_generations(ctx.sync_id)
            .context("Failed to list snapshot generations")?;
        let obsolete = obsolete_generations(
            &generations,
            ctx.prior_change_id,
            self.config.retained_generations,
        );

        if self.new_messages.is_empty() {
            self.store
                .delete_snapshot_generations(ctx.sync_id, &obsolete)
                .context("Failed to compact snapshot generations")?;
        } else if self.config.atomic_finalize {
            self.store
                .commit_snapshot(&SnapshotCommit {
                    sync_id: ctx.sync_id,
                    change_id: max_change,
                    messages: &self.new_messages,
                    obsolete: &obsolete,
                })
                .context("Failed to commit cursor snapshot")?;
        } else {
            self.store
                .delete_snapshot_generations(ctx.sync_id, &obsolete)
                .context("Failed to compact snapshot generations")?;
            self.store
                .write_snapshot(ctx.sync_id, max_change, &self.new_messages)
                .context("Failed to write cursor snapshot")?;
        }
        debug!(
            "Sync {}: {} snapshot entries at {}, {} generations pruned",
            ctx.sync_id,
            self.new_messages.len(),
            max_change,
            obsolete.len()
        );

        info!(
            "Sync {} of folder {}: {} changes, cursor {} -> {}",
            ctx.sync_id,
            ctx.folder,
            self.changes.len(),
            ctx.prior_change_id,
            max_change
        );

        self.stage = Stage::Finalized;
        Ok(SyncResponse {
            new_change_id: max_change,
            changes: std::mem::take(&mut self.changes),
        })
    }

    /// Run every stage in order
    pub fn run(mut self) -> IcsResult<SyncResponse> {
        self.init()?;
        self.select()?;
        self.classify()?;
        self.finalize()
    }
}

/// Compute the changes a client must apply to catch up from its cursor
///
/// Safe to retry with the same cursor after any error.
pub fn get_content_changes(
    store: &dyn SyncStore,
    gate: &dyn RestrictionGate,
    config: &IcsConfig,
    ctx: SyncContext,
) -> IcsResult<SyncResponse> {
    SyncOrchestrator::new(store, gate, config, ctx).run()
}
