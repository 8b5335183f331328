//! Snapshot generation pruning
//!
//! Pure functions that can be tested without a store.

use crate::models::ChangeId;

/// Generations a finalize must delete before writing its new snapshot.
///
/// A client resuming from `prior` can never come back to a newer state other
/// than the one about to be written, so every generation above `prior` goes.
/// At or below `prior`, the `retained` newest generations stay as a rollback
/// window and everything older goes.
///
/// # Arguments
/// * `generations` - Existing generations of the session, in any order
/// * `prior` - Change id the client resumed from
/// * `retained` - Generations kept at or below `prior`
///
/// # Returns
/// Obsolete generations, ascending
pub fn obsolete_generations(
    generations: &[ChangeId],
    prior: ChangeId,
    retained: usize,
) -> Vec<ChangeId> {
    let mut sorted = generations.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let split = sorted.partition_point(|&generation| generation <= prior);
    let keep_from = split.saturating_sub(retained);

    sorted[..keep_from]
        .iter()
        .chain(&sorted[split..])
        .copied()
        .collect()
}
