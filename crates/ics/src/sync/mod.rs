//! Incremental content synchronization engine
//!
//! Safe to retry: nothing is persisted until an orchestration finalizes.

mod classifier;
mod compaction;
mod context;
mod maintenance;
mod orchestrator;
mod recorder;
mod registry;
mod selector;

pub use classifier::{ChangeClassifier, Classified, LegacyClassifier, NonLegacyFullClassifier};
pub use compaction::obsolete_generations;
pub use context::{SyncContext, SyncResponse};
pub use maintenance::{
    MaintenanceReport, cleanup_expired_syncs, cleanup_orphaned_snapshots, run_maintenance,
};
pub use orchestrator::{Stage, SyncOrchestrator, get_content_changes};
pub use recorder::{record_change, within_latest_snapshot};
pub use registry::{register_sync, sync_contents, sync_states};
pub use selector::CandidateSelector;
