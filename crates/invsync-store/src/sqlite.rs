//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend for invsync. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use invsync_core::{
    ConcurrencyLock, EntityWrite, Fingerprint, KnownEntity, LockAcquisition, NaturalKey,
    ReconciledEntity, RecordKind, RunId, RunStatus, SyncRun, SyncTier, TierWatermarks, Timestamp,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::Store;

/// How long a connection waits for another writer before failing with BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime. Several `SqliteStore`s (in one
/// process or many) may share a database file; the lock row is the only
/// coordination point between them.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(StoreError::poisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(StoreError::join)?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

fn conversion<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

const ENTITY_COLUMNS: &str = "kind, natural_key, fields, fingerprint, active, last_synced_at,
     last_run_id, quantity_on_hand, reorder_point";

fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReconciledEntity> {
    let kind: String = row.get(0)?;
    let key: String = row.get(1)?;
    let fields: String = row.get(2)?;
    let fingerprint: Vec<u8> = row.get(3)?;
    let last_run_id: String = row.get(6)?;

    Ok(ReconciledEntity {
        kind: kind.parse().map_err(|e| conversion(0, e))?,
        key: NaturalKey::new(key).map_err(|e| conversion(1, e))?,
        fields: serde_json::from_str(&fields).map_err(|e| conversion(2, e))?,
        fingerprint: Fingerprint::from_slice(&fingerprint)
            .ok_or_else(|| rusqlite::Error::InvalidColumnType(3, "fingerprint".into(), Type::Blob))?,
        active: row.get(4)?,
        last_synced_at: row.get(5)?,
        last_run_id: last_run_id.parse().map_err(|e| conversion(6, e))?,
        quantity_on_hand: row.get(7)?,
        reorder_point: row.get(8)?,
    })
}

const RUN_COLUMNS: &str = "run_id, strategy, redrive_of, tier, dry_run, status, started_at,
     finished_at, counts, failures, listing_failures, error";

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRun> {
    let id: String = row.get(0)?;
    let strategy: Option<String> = row.get(1)?;
    let redrive_of: Option<String> = row.get(2)?;
    let tier: Option<String> = row.get(3)?;
    let status: String = row.get(5)?;
    let counts: String = row.get(8)?;
    let failures: String = row.get(9)?;
    let listing_failures: String = row.get(10)?;

    Ok(SyncRun {
        id: id.parse().map_err(|e| conversion(0, e))?,
        strategy: strategy
            .map(|s| s.parse())
            .transpose()
            .map_err(|e| conversion(1, e))?,
        redrive_of: redrive_of
            .map(|s| s.parse())
            .transpose()
            .map_err(|e| conversion(2, e))?,
        tier: tier
            .map(|s| s.parse::<SyncTier>())
            .transpose()
            .map_err(|e| conversion(3, e))?,
        dry_run: row.get(4)?,
        status: status.parse().map_err(|e| conversion(5, e))?,
        started_at: row.get(6)?,
        finished_at: row.get(7)?,
        counts: serde_json::from_str(&counts).map_err(|e| conversion(8, e))?,
        failures: serde_json::from_str(&failures).map_err(|e| conversion(9, e))?,
        listing_failures: serde_json::from_str(&listing_failures)
            .map_err(|e| conversion(10, e))?,
        error: row.get(11)?,
    })
}

fn row_to_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConcurrencyLock> {
    let holder: String = row.get(0)?;
    Ok(ConcurrencyLock {
        holder: holder.parse().map_err(|e| conversion(0, e))?,
        acquired_at: row.get(1)?,
        heartbeat_at: row.get(2)?,
    })
}

fn read_lock(conn: &Connection) -> Result<Option<ConcurrencyLock>> {
    conn.query_row(
        "SELECT holder, acquired_at, heartbeat_at FROM sync_lock WHERE id = 1",
        [],
        row_to_lock,
    )
    .optional()
    .map_err(StoreError::from)
}

/// Mark a run stuck if it is not terminal. Returns whether a row changed.
fn mark_stuck(conn: &Connection, id: RunId, now: Timestamp, reason: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sync_runs SET status = ?1, finished_at = ?2, error = ?3
         WHERE run_id = ?4 AND status IN ('pending', 'running')",
        params![RunStatus::Stuck.as_str(), now, reason, id.to_string()],
    )?;
    Ok(changed > 0)
}

struct RunParams {
    id: String,
    strategy: Option<&'static str>,
    redrive_of: Option<String>,
    tier: Option<&'static str>,
    dry_run: bool,
    status: &'static str,
    started_at: Timestamp,
    finished_at: Option<Timestamp>,
    counts: String,
    failures: String,
    listing_failures: String,
    error: Option<String>,
}

impl RunParams {
    fn from_run(run: &SyncRun) -> Result<Self> {
        Ok(Self {
            id: run.id.to_string(),
            strategy: run.strategy.map(|s| s.as_str()),
            redrive_of: run.redrive_of.map(|r| r.to_string()),
            tier: run.tier.map(|t| t.as_str()),
            dry_run: run.dry_run,
            status: run.status.as_str(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            counts: serde_json::to_string(&run.counts)?,
            failures: serde_json::to_string(&run.failures)?,
            listing_failures: serde_json::to_string(&run.listing_failures)?,
            error: run.error.clone(),
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_known(
        &self,
        kind: RecordKind,
        keys: &[NaturalKey],
    ) -> Result<BTreeMap<NaturalKey, KnownEntity>> {
        let keys = keys.to_vec();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT fingerprint, active FROM entities WHERE kind = ?1 AND natural_key = ?2",
            )?;
            let mut known = BTreeMap::new();
            for key in keys {
                let row: Option<(Vec<u8>, bool)> = stmt
                    .query_row(params![kind.as_str(), key.as_str()], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .optional()?;
                if let Some((bytes, active)) = row {
                    let fingerprint = Fingerprint::from_slice(&bytes).ok_or_else(|| {
                        StoreError::InvalidData(format!("bad fingerprint for {}/{}", kind, key))
                    })?;
                    known.insert(key, KnownEntity { fingerprint, active });
                }
            }
            Ok(known)
        })
        .await
    }

    async fn get_entities(
        &self,
        kind: RecordKind,
        keys: &[NaturalKey],
    ) -> Result<BTreeMap<NaturalKey, ReconciledEntity>> {
        let keys = keys.to_vec();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM entities WHERE kind = ?1 AND natural_key = ?2",
                ENTITY_COLUMNS
            ))?;
            let mut entities = BTreeMap::new();
            for key in keys {
                if let Some(entity) = stmt
                    .query_row(params![kind.as_str(), key.as_str()], row_to_entity)
                    .optional()?
                {
                    entities.insert(key, entity);
                }
            }
            Ok(entities)
        })
        .await
    }

    async fn get_entity(
        &self,
        kind: RecordKind,
        key: &NaturalKey,
    ) -> Result<Option<ReconciledEntity>> {
        let key = key.clone();
        self.blocking(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM entities WHERE kind = ?1 AND natural_key = ?2",
                    ENTITY_COLUMNS
                ),
                params![kind.as_str(), key.as_str()],
                row_to_entity,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_entities(
        &self,
        kind: RecordKind,
        active_only: bool,
    ) -> Result<Vec<ReconciledEntity>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM entities
                 WHERE kind = ?1 AND (?2 = 0 OR active = 1)
                 ORDER BY natural_key",
                ENTITY_COLUMNS
            ))?;
            let entities = stmt
                .query_map(params![kind.as_str(), active_only], row_to_entity)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entities)
        })
        .await
    }

    async fn upsert_entities(
        &self,
        writes: &[EntityWrite],
        run_id: RunId,
        now: Timestamp,
    ) -> Result<usize> {
        let writes = writes.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO entities (
                        kind, natural_key, fields, fingerprint, active,
                        last_synced_at, last_run_id, quantity_on_hand, reorder_point
                    ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8)
                    ON CONFLICT(kind, natural_key) DO UPDATE SET
                        fields = excluded.fields,
                        fingerprint = excluded.fingerprint,
                        active = 1,
                        last_synced_at = excluded.last_synced_at,
                        last_run_id = excluded.last_run_id,
                        quantity_on_hand = excluded.quantity_on_hand,
                        reorder_point = excluded.reorder_point",
                )?;
                let run = run_id.to_string();
                for write in &writes {
                    let fields = serde_json::to_string(&write.fields)?;
                    stmt.execute(params![
                        write.kind.as_str(),
                        write.key.as_str(),
                        fields,
                        write.fingerprint.as_bytes().as_slice(),
                        now,
                        run,
                        write.quantity_on_hand,
                        write.reorder_point,
                    ])
                    .map_err(|e| match e {
                        rusqlite::Error::SqliteFailure(err, msg)
                            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                        {
                            StoreError::Conflict {
                                kind: write.kind.to_string(),
                                key: write.key.to_string(),
                                reason: msg.unwrap_or_else(|| err.to_string()),
                            }
                        }
                        other => StoreError::Database(other),
                    })?;
                }
            }
            tx.commit()?;
            Ok(writes.len())
        })
        .await
    }

    async fn deactivate_absent(
        &self,
        kind: RecordKind,
        seen: &BTreeSet<NaturalKey>,
        run_id: RunId,
        now: Timestamp,
    ) -> Result<Vec<NaturalKey>> {
        let seen = seen.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let active: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT natural_key FROM entities WHERE kind = ?1 AND active = 1
                     ORDER BY natural_key",
                )?;
                let rows = stmt
                    .query_map(params![kind.as_str()], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                rows
            };

            let mut deactivated = Vec::new();
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE entities SET active = 0, last_synced_at = ?1, last_run_id = ?2
                     WHERE kind = ?3 AND natural_key = ?4",
                )?;
                let run = run_id.to_string();
                for raw in active {
                    let key = NaturalKey::new(&raw)
                        .map_err(|e| StoreError::InvalidData(e.to_string()))?;
                    if !seen.contains(&key) {
                        stmt.execute(params![now, run, kind.as_str(), raw])?;
                        deactivated.push(key);
                    }
                }
            }
            tx.commit()?;
            Ok(deactivated)
        })
        .await
    }

    async fn active_keys(&self, kind: RecordKind) -> Result<BTreeSet<NaturalKey>> {
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare("SELECT natural_key FROM entities WHERE kind = ?1 AND active = 1")?;
            let rows = stmt
                .query_map(params![kind.as_str()], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|k| NaturalKey::new(k).map_err(|e| StoreError::InvalidData(e.to_string())))
                .collect()
        })
        .await
    }

    async fn critical_keys(&self) -> Result<BTreeSet<NaturalKey>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT natural_key FROM entities
                 WHERE kind = 'item' AND active = 1
                   AND quantity_on_hand IS NOT NULL AND reorder_point IS NOT NULL
                   AND quantity_on_hand <= reorder_point",
            )?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|k| NaturalKey::new(k).map_err(|e| StoreError::InvalidData(e.to_string())))
                .collect()
        })
        .await
    }

    async fn try_acquire_lock(
        &self,
        run_id: RunId,
        now: Timestamp,
        stale_after_ms: i64,
    ) -> Result<LockAcquisition> {
        self.blocking(move |conn| {
            // IMMEDIATE takes the write lock up front, so the read of the
            // previous holder and the conditional upsert cannot interleave
            // with another process.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let previous = read_lock(&tx)?;

            let changed = tx.execute(
                "INSERT INTO sync_lock (id, holder, acquired_at, heartbeat_at)
                 VALUES (1, ?1, ?2, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                    holder = excluded.holder,
                    acquired_at = excluded.acquired_at,
                    heartbeat_at = excluded.heartbeat_at
                 WHERE sync_lock.heartbeat_at < ?3",
                params![run_id.to_string(), now, now.saturating_sub(stale_after_ms)],
            )?;

            let outcome = match (changed, previous) {
                (0, Some(holder)) => LockAcquisition::Contended { holder },
                (0, None) => {
                    return Err(StoreError::InvalidData(
                        "lock upsert changed nothing without a holder".into(),
                    ))
                }
                (_, None) => LockAcquisition::Acquired,
                (_, Some(previous)) => {
                    mark_stuck(
                        &tx,
                        previous.holder,
                        now,
                        &format!("lock reclaimed by run {}", run_id),
                    )?;
                    LockAcquisition::Reclaimed { previous }
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn heartbeat_lock(&self, run_id: RunId, now: Timestamp) -> Result<bool> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE sync_lock SET heartbeat_at = ?1 WHERE id = 1 AND holder = ?2",
                params![now, run_id.to_string()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn release_lock(&self, run_id: RunId) -> Result<bool> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "DELETE FROM sync_lock WHERE id = 1 AND holder = ?1",
                params![run_id.to_string()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn current_lock(&self) -> Result<Option<ConcurrencyLock>> {
        self.blocking(|conn| read_lock(conn)).await
    }

    async fn insert_run(&self, run: &SyncRun) -> Result<()> {
        let p = RunParams::from_run(run)?;
        self.blocking(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO sync_runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    RUN_COLUMNS
                ),
                params![
                    p.id,
                    p.strategy,
                    p.redrive_of,
                    p.tier,
                    p.dry_run,
                    p.status,
                    p.started_at,
                    p.finished_at,
                    p.counts,
                    p.failures,
                    p.listing_failures,
                    p.error,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_run(&self, run: &SyncRun) -> Result<()> {
        let p = RunParams::from_run(run)?;
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stored: Option<String> = tx
                .query_row(
                    "SELECT status FROM sync_runs WHERE run_id = ?1",
                    params![p.id],
                    |row| row.get(0),
                )
                .optional()?;

            let stored: RunStatus = match stored {
                None => return Err(StoreError::RunNotFound(p.id)),
                Some(s) => s.parse().map_err(|e: invsync_core::CoreError| {
                    StoreError::InvalidData(e.to_string())
                })?,
            };
            if stored.is_terminal() {
                return Err(StoreError::RunFinalized(p.id));
            }

            tx.execute(
                "UPDATE sync_runs SET
                    strategy = ?2, redrive_of = ?3, tier = ?4, dry_run = ?5, status = ?6,
                    started_at = ?7, finished_at = ?8, counts = ?9, failures = ?10,
                    listing_failures = ?11, error = ?12
                 WHERE run_id = ?1",
                params![
                    p.id,
                    p.strategy,
                    p.redrive_of,
                    p.tier,
                    p.dry_run,
                    p.status,
                    p.started_at,
                    p.finished_at,
                    p.counts,
                    p.failures,
                    p.listing_failures,
                    p.error,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_run(&self, id: RunId) -> Result<Option<SyncRun>> {
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM sync_runs WHERE run_id = ?1", RUN_COLUMNS),
                params![id.to_string()],
                row_to_run,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<SyncRun>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sync_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
                RUN_COLUMNS
            ))?;
            let runs = stmt
                .query_map(params![limit], row_to_run)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(runs)
        })
        .await
    }

    async fn mark_run_stuck(&self, id: RunId, now: Timestamp) -> Result<bool> {
        self.blocking(move |conn| mark_stuck(conn, id, now, "run abandoned")).await
    }

    async fn tier_watermarks(&self) -> Result<TierWatermarks> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tier, MAX(started_at) FROM sync_runs
                 WHERE status = 'succeeded' AND dry_run = 0 AND tier IS NOT NULL
                 GROUP BY tier",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut watermarks = TierWatermarks::default();
            for (tier, started_at) in rows {
                let tier: SyncTier = tier
                    .parse()
                    .map_err(|e: invsync_core::CoreError| StoreError::InvalidData(e.to_string()))?;
                watermarks.record(tier, started_at);
            }
            Ok(watermarks)
        })
        .await
    }
}
