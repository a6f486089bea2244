//! SQLite schema migrations.
//!
//! Migrations are applied in order inside one transaction. Each step moves
//! the schema from version N-1 to N and is recorded in `schema_migrations`.

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> Result<()>;

/// Every migration, in version order. Version N is at index N-1.
const STEPS: &[Step] = &[apply_v1, apply_v2];

/// Current schema version.
pub const CURRENT_VERSION: u32 = STEPS.len() as u32;

/// Bring the schema up to [`CURRENT_VERSION`]. Safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let applied = applied_version(conn)?;
    if applied > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{} is newer than supported v{}",
            applied, CURRENT_VERSION
        )));
    }
    if applied == CURRENT_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (version, step) in (1..=CURRENT_VERSION).zip(STEPS).skip(applied as usize) {
        step(&tx)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, now_millis()],
        )?;
    }
    tx.commit()?;
    info!(from = applied, to = CURRENT_VERSION, "schema migrated");
    Ok(())
}

fn applied_version(conn: &Connection) -> Result<u32> {
    let version: Option<u32> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Reconciled entities: one row per (kind, natural key)
        CREATE TABLE entities (
            kind TEXT NOT NULL,                -- 'item' | 'vendor'
            natural_key TEXT NOT NULL,         -- SKU or vendor id
            fields TEXT NOT NULL,              -- JSON object, full raw field set
            fingerprint BLOB NOT NULL,         -- 32 bytes, Blake3 over material fields
            active INTEGER NOT NULL DEFAULT 1, -- soft-delete flag
            last_synced_at INTEGER NOT NULL,   -- Unix ms
            last_run_id TEXT NOT NULL,         -- run that last wrote the row
            quantity_on_hand REAL,             -- extracted for reorder queries
            reorder_point REAL,

            PRIMARY KEY (kind, natural_key)
        );

        -- Singleton lock row
        CREATE TABLE sync_lock (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            heartbeat_at INTEGER NOT NULL
        );

        -- Sync log
        CREATE TABLE sync_runs (
            run_id TEXT PRIMARY KEY,
            strategy TEXT,                     -- requested strategy, NULL for re-drives
            redrive_of TEXT,
            tier TEXT,                         -- resolved tier
            dry_run INTEGER NOT NULL,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            counts TEXT NOT NULL,              -- JSON
            failures TEXT NOT NULL,            -- JSON array of batch failures
            listing_failures TEXT NOT NULL,    -- JSON array of listing failures
            error TEXT
        );

        CREATE INDEX idx_entities_active ON entities(kind, active);
        CREATE INDEX idx_sync_runs_started ON sync_runs(started_at);
        "#,
    )?;

    Ok(())
}

/// Migration v2: Index for reorder-point queries.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE INDEX idx_entities_reorder ON entities(kind, active, quantity_on_hand, reorder_point)
            WHERE quantity_on_hand IS NOT NULL AND reorder_point IS NOT NULL;
        CREATE INDEX idx_sync_runs_status_tier ON sync_runs(status, tier);
        "#,
    )?;

    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"entities".to_string()));
        assert!(tables.contains(&"sync_lock".to_string()));
        assert!(tables.contains(&"sync_runs".to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(applied_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations VALUES (?1, 0)",
            [CURRENT_VERSION + 1],
        )
        .unwrap();
        assert!(matches!(migrate(&mut conn), Err(StoreError::Migration(_))));
    }

    #[test]
    fn test_lock_row_is_singleton() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        conn.execute(
            "INSERT INTO sync_lock (id, holder, acquired_at, heartbeat_at) VALUES (1, 'a', 0, 0)",
            [],
        )
        .unwrap();
        let second = conn.execute(
            "INSERT INTO sync_lock (id, holder, acquired_at, heartbeat_at) VALUES (2, 'b', 0, 0)",
            [],
        );
        assert!(second.is_err());
    }

    #[test]
    fn test_migrates_from_v1() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL)",
            [],
        )
        .unwrap();
        apply_v1(&conn).unwrap();
        conn.execute("INSERT INTO schema_migrations VALUES (1, 0)", []).unwrap();

        migrate(&mut conn).unwrap();

        let index: String = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='index' AND name='idx_entities_reorder'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(index, "idx_entities_reorder");
    }
}
