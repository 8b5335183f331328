//! Storage backends for the change log, cursor snapshots and session registry

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemorySyncStore;
pub use sqlite::SqliteSyncStore;
pub use traits::{FullQuery, IncrementalQuery, SnapshotCommit, SyncStore};
