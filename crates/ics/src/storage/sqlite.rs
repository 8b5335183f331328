//! SQLite-based synchronization storage

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use rusqlite_migration::{M, Migrations};

use super::{FullQuery, IncrementalQuery, SnapshotCommit, SyncStore};
use crate::models::{
    CandidateRow, ChangeId, ChangeType, LiveObject, MessageEntry, MessageSet, NewChange,
    SourceKey, SyncFlags, SyncId, SyncKind, SyncRegistration, object_flags,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Change log, live objects and cursor snapshots
        M::up(
            r#"
            -- Append-only change log. AUTOINCREMENT keeps ids from being reused.
            CREATE TABLE changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_key BLOB NOT NULL,
                parent_source_key BLOB NOT NULL,
                change_type INTEGER NOT NULL,
                flags INTEGER NOT NULL DEFAULT 0,
                source_sync INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_changes_parent ON changes(parent_source_key, id);
            CREATE INDEX idx_changes_object
                ON changes(source_key, parent_source_key, change_type);

            -- Live message objects
            CREATE TABLE objects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_key BLOB NOT NULL UNIQUE,
                parent_source_key BLOB NOT NULL,
                flags INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_objects_parent ON objects(parent_source_key, id DESC);

            -- Per-session cursor snapshots
            CREATE TABLE synced_messages (
                sync_id INTEGER NOT NULL,
                change_id INTEGER NOT NULL,
                source_key BLOB NOT NULL,
                parent_source_key BLOB NOT NULL,
                PRIMARY KEY (sync_id, change_id, source_key)
            );
            "#,
        ),
        // Migration 2: Session registry
        M::up(
            r#"
            CREATE TABLE syncs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_key BLOB NOT NULL,
                sync_type INTEGER NOT NULL,
                change_id INTEGER NOT NULL DEFAULT 0,
                sync_time TEXT NOT NULL
            );

            CREATE INDEX idx_syncs_source_key ON syncs(source_key);
            "#,
        ),
    ])
}

/// SQLite-based synchronization storage
pub struct SqliteSyncStore {
    conn: Mutex<Connection>,
}

impl SqliteSyncStore {
    /// Open (or create) a store at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::from_connection(conn)
    }

    /// Create a store backed by a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets pollers read while a finalize writes.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("SQLite connection mutex poisoned"))
    }

    fn delete_generations(
        conn: &Connection,
        sync_id: SyncId,
        change_ids: &[ChangeId],
    ) -> Result<usize> {
        let mut stmt =
            conn.prepare("DELETE FROM synced_messages WHERE sync_id = ? AND change_id = ?")?;
        let mut removed = 0;
        for change_id in change_ids {
            removed += stmt.execute(params![sync_id as i64, *change_id as i64])?;
        }
        Ok(removed)
    }

    fn insert_generation(
        conn: &Connection,
        sync_id: SyncId,
        change_id: ChangeId,
        messages: &MessageSet,
    ) -> Result<()> {
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO synced_messages
             (sync_id, change_id, source_key, parent_source_key)
             VALUES (?, ?, ?, ?)",
        )?;
        for (source_key, entry) in messages.iter() {
            stmt.execute(params![
                sync_id as i64,
                change_id as i64,
                source_key.as_bytes(),
                entry.parent_source_key.as_bytes(),
            ])?;
        }
        Ok(())
    }
}

/// Map a change-log row selected as
/// `id, source_key, parent_source_key, change_type, flags, source_sync`
fn incremental_row(row: &Row<'_>) -> rusqlite::Result<CandidateRow> {
    Ok(CandidateRow {
        change_id: row.get::<_, i64>(0)? as ChangeId,
        source_key: SourceKey::new(row.get::<_, Vec<u8>>(1)?),
        parent_source_key: SourceKey::new(row.get::<_, Vec<u8>>(2)?),
        change_type: ChangeType(row.get::<_, i64>(3)? as u32),
        change_flags: row.get::<_, i64>(4)? as u32,
        object_flags: None,
        source_sync: row.get::<_, i64>(5)? as SyncId,
    })
}

/// Map a live-object row selected as
/// `c.id, o.source_key, o.parent_source_key, o.flags, c.source_sync`
fn full_row(row: &Row<'_>) -> rusqlite::Result<CandidateRow> {
    Ok(CandidateRow {
        change_id: row.get::<_, Option<i64>>(0)?.unwrap_or(0) as ChangeId,
        source_key: SourceKey::new(row.get::<_, Vec<u8>>(1)?),
        parent_source_key: SourceKey::new(row.get::<_, Vec<u8>>(2)?),
        change_type: ChangeType::MESSAGE_NEW,
        change_flags: 0,
        object_flags: Some(row.get::<_, i64>(3)? as u32),
        source_sync: row.get::<_, Option<i64>>(4)?.unwrap_or(0) as SyncId,
    })
}

/// SQL fragment restricting `column` to the requested item classes
fn item_class_filter(column: &str, query_flags: SyncFlags) -> String {
    let mut sql = String::new();
    if !query_flags.includes_associated() {
        sql.push_str(&format!(
            " AND {} & {} = 0",
            column,
            object_flags::ASSOCIATED
        ));
    }
    if !query_flags.includes_normal() {
        sql.push_str(&format!(
            " AND {} & {} = {}",
            column,
            object_flags::ASSOCIATED,
            object_flags::ASSOCIATED
        ));
    }
    sql
}

impl SyncStore for SqliteSyncStore {
    fn append_change(&self, change: &NewChange) -> Result<ChangeId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO changes (source_key, parent_source_key, change_type, flags, source_sync)
             VALUES (?, ?, ?, ?, ?)",
            params![
                change.source_key.as_bytes(),
                change.parent_source_key.as_bytes(),
                change.change_type.0 as i64,
                change.flags as i64,
                change.source_sync as i64,
            ],
        )
        .context("Failed to append change record")?;
        Ok(conn.last_insert_rowid() as ChangeId)
    }

    fn max_change_id(&self, folder: &SourceKey) -> Result<ChangeId> {
        let conn = self.conn()?;
        let max: Option<i64> = if folder.is_empty() {
            conn.query_row("SELECT MAX(id) FROM changes", [], |row| row.get(0))?
        } else {
            conn.query_row(
                "SELECT MAX(id) FROM changes WHERE parent_source_key = ?",
                [folder.as_bytes()],
                |row| row.get(0),
            )?
        };
        Ok(max.unwrap_or(0) as ChangeId)
    }

    fn incremental_candidates(&self, query: &IncrementalQuery) -> Result<Vec<CandidateRow>> {
        let mut sql = format!(
            "SELECT id, source_key, parent_source_key, change_type, flags, source_sync
             FROM changes
             WHERE id > ? AND change_type & {} != 0 AND source_sync != ?",
            ChangeType::MESSAGE
        );
        let mut values = vec![
            Value::Integer(query.after_change_id as i64),
            Value::Integer(query.sync_id as i64),
        ];

        if !query.folder.is_empty() {
            sql.push_str(" AND parent_source_key = ?");
            values.push(Value::Blob(query.folder.as_bytes().to_vec()));
        }

        sql.push_str(&item_class_filter("flags", query.flags));

        let action = format!("change_type & {}", ChangeType::ACTION_MASK);
        if query.flags.suppresses_deletions() {
            sql.push_str(&format!(
                " AND {} != {} AND {} != {}",
                action,
                ChangeType::SOFT_DELETE,
                action,
                ChangeType::HARD_DELETE
            ));
        } else if query.flags.suppresses_soft_deletions() {
            sql.push_str(&format!(" AND {} != {}", action, ChangeType::SOFT_DELETE));
        }
        if query.flags.suppresses_read_state() {
            sql.push_str(&format!(" AND {} != {}", action, ChangeType::FLAG));
        }
        sql.push_str(" ORDER BY id");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), incremental_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to select incremental candidates")?;
        Ok(rows)
    }

    fn full_candidates(&self, query: &FullQuery) -> Result<Vec<CandidateRow>> {
        let mut sql = format!(
            "SELECT c.id, o.source_key, o.parent_source_key, o.flags, c.source_sync
             FROM objects o
             LEFT JOIN changes c ON c.id = (
                 SELECT MAX(n.id) FROM changes n
                 WHERE n.source_key = o.source_key
                   AND n.parent_source_key = o.parent_source_key
                   AND n.change_type = {}
             )
             WHERE o.parent_source_key = ? AND o.flags & {} = 0",
            ChangeType::MESSAGE_NEW.0,
            object_flags::DELETED
        );
        let mut values = vec![Value::Blob(query.folder.as_bytes().to_vec())];

        sql.push_str(&item_class_filter("o.flags", query.flags));

        if let Some(author) = query.exclude_author {
            sql.push_str(" AND (c.source_sync IS NULL OR c.source_sync != ?)");
            values.push(Value::Integer(author as i64));
        }
        sql.push_str(" ORDER BY o.id DESC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), full_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to select live objects")?;
        Ok(rows)
    }

    fn put_object(&self, object: &LiveObject) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO objects (source_key, parent_source_key, flags) VALUES (?, ?, ?)
             ON CONFLICT(source_key) DO UPDATE SET
                parent_source_key = excluded.parent_source_key,
                flags = excluded.flags",
            params![
                object.source_key.as_bytes(),
                object.parent_source_key.as_bytes(),
                object.flags as i64,
            ],
        )?;
        Ok(())
    }

    fn remove_object(&self, source_key: &SourceKey) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM objects WHERE source_key = ?",
            [source_key.as_bytes()],
        )?;
        Ok(removed > 0)
    }

    fn load_snapshot(&self, sync_id: SyncId, change_id: ChangeId) -> Result<MessageSet> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT m.source_key, m.parent_source_key, c.change_type, c.flags
             FROM synced_messages m
             LEFT JOIN changes c
                ON c.source_key = m.source_key
               AND c.parent_source_key = m.parent_source_key
               AND c.id > ?2
               AND c.source_sync != ?1
               AND c.change_type & {} != 0
             WHERE m.sync_id = ?1 AND m.change_id = ?2
             ORDER BY c.id",
            ChangeType::MESSAGE
        ))?;

        let rows = stmt
            .query_map(params![sync_id as i64, change_id as i64], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to load snapshot {}/{}", sync_id, change_id))?;

        let mut set = MessageSet::new();
        for (source_key, parent, change_type, flags) in rows {
            let entry = set
                .entry(SourceKey::new(source_key))
                .or_insert_with(|| MessageEntry::new(SourceKey::new(parent)));
            if let Some(change_type) = change_type {
                entry.accumulate(ChangeType(change_type as u32), flags.unwrap_or(0) as u32);
            }
        }
        Ok(set)
    }

    fn snapshot_generations(&self, sync_id: SyncId) -> Result<Vec<ChangeId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT change_id FROM synced_messages WHERE sync_id = ? ORDER BY change_id",
        )?;
        let generations = stmt
            .query_map([sync_id as i64], |row| row.get::<_, i64>(0))?
            .map(|id| id.map(|id| id as ChangeId))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(generations)
    }

    fn latest_snapshot_generation(&self, sync_id: SyncId) -> Result<Option<ChangeId>> {
        let conn = self.conn()?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(change_id) FROM synced_messages WHERE sync_id = ?",
            [sync_id as i64],
            |row| row.get(0),
        )?;
        Ok(max.map(|id| id as ChangeId))
    }

    fn write_snapshot(
        &self,
        sync_id: SyncId,
        change_id: ChangeId,
        messages: &MessageSet,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::insert_generation(&tx, sync_id, change_id, messages)?;
        tx.commit()?;
        Ok(())
    }

    fn delete_snapshot_generations(
        &self,
        sync_id: SyncId,
        change_ids: &[ChangeId],
    ) -> Result<usize> {
        let conn = self.conn()?;
        Self::delete_generations(&conn, sync_id, change_ids)
    }

    fn delete_snapshots_after(&self, sync_id: SyncId, change_id: ChangeId) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM synced_messages WHERE sync_id = ? AND change_id > ?",
            params![sync_id as i64, change_id as i64],
        )?;
        Ok(removed)
    }

    fn commit_snapshot(&self, commit: &SnapshotCommit<'_>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::delete_generations(&tx, commit.sync_id, commit.obsolete)?;
        Self::insert_generation(&tx, commit.sync_id, commit.change_id, commit.messages)?;
        tx.commit().context("Failed to commit snapshot")?;
        Ok(())
    }

    fn add_snapshot_entry(
        &self,
        sync_id: SyncId,
        change_id: ChangeId,
        source_key: &SourceKey,
        parent_source_key: &SourceKey,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO synced_messages
             (sync_id, change_id, source_key, parent_source_key)
             VALUES (?, ?, ?, ?)",
            params![
                sync_id as i64,
                change_id as i64,
                source_key.as_bytes(),
                parent_source_key.as_bytes(),
            ],
        )?;
        Ok(())
    }

    fn remove_snapshot_entry(
        &self,
        sync_id: SyncId,
        change_id: ChangeId,
        source_key: &SourceKey,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM synced_messages WHERE sync_id = ? AND change_id = ? AND source_key = ?",
            params![sync_id as i64, change_id as i64, source_key.as_bytes()],
        )?;
        Ok(removed > 0)
    }

    fn snapshot_contains(
        &self,
        sync_id: SyncId,
        change_id: ChangeId,
        source_key: &SourceKey,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM synced_messages
                 WHERE sync_id = ? AND change_id = ? AND source_key = ?",
                params![sync_id as i64, change_id as i64, source_key.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn delete_orphaned_snapshots(&self) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM synced_messages WHERE sync_id NOT IN (SELECT id FROM syncs)",
            [],
        )?;
        Ok(removed)
    }

    fn register_sync(
        &self,
        folder: &SourceKey,
        kind: SyncKind,
        at: DateTime<Utc>,
    ) -> Result<SyncId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO syncs (source_key, sync_type, change_id, sync_time) VALUES (?, ?, 0, ?)",
            params![folder.as_bytes(), kind.as_i64(), at.to_rfc3339()],
        )
        .context("Failed to register sync")?;
        Ok(conn.last_insert_rowid() as SyncId)
    }

    fn get_sync(&self, sync_id: SyncId) -> Result<Option<SyncRegistration>> {
        let conn = self.conn()?;
        let row: Option<(Vec<u8>, i64, i64, String)> = conn
            .query_row(
                "SELECT source_key, sync_type, change_id, sync_time FROM syncs WHERE id = ?",
                [sync_id as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((folder, sync_type, change_id, sync_time)) = row else {
            return Ok(None);
        };

        let kind = SyncKind::from_i64(sync_type)
            .with_context(|| format!("Unknown sync type {} for sync {}", sync_type, sync_id))?;
        let sync_time = DateTime::parse_from_rfc3339(&sync_time)
            .map(|dt| dt.with_timezone(&Utc))
            .with_context(|| format!("Invalid sync time for sync {}", sync_id))?;

        Ok(Some(SyncRegistration {
            sync_id,
            folder: SourceKey::new(folder),
            kind,
            change_id: change_id as ChangeId,
            sync_time,
        }))
    }

    fn update_sync(&self, sync_id: SyncId, change_id: ChangeId, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE syncs SET change_id = ?, sync_time = ? WHERE id = ?",
            params![change_id as i64, at.to_rfc3339(), sync_id as i64],
        )?;
        Ok(updated > 0)
    }

    fn is_folder_tracked(&self, folder: &SourceKey) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM syncs WHERE source_key = ? LIMIT 1",
                [folder.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn delete_syncs_idle_since(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let expired: Vec<i64> = {
            let mut stmt = tx.prepare("SELECT id, sync_time FROM syncs")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .filter(|(_, sync_time)| {
                    DateTime::parse_from_rfc3339(sync_time)
                        .map(|dt| dt.with_timezone(&Utc) < cutoff)
                        .unwrap_or(false)
                })
                .map(|(id, _)| id)
                .collect()
        };
        for id in &expired {
            tx.execute("DELETE FROM syncs WHERE id = ?", [id])?;
        }
        tx.commit()?;
        Ok(expired.len())
    }
}
