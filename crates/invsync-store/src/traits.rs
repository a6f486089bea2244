//! Store trait: the abstract interface of the local reconciled store.
//!
//! The engine is storage-agnostic. Implementations include SQLite (primary)
//! and in-memory (for tests).

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use invsync_core::{
    ConcurrencyLock, EntityWrite, KnownEntity, LockAcquisition, NaturalKey, ReconciledEntity,
    RecordKind, RunId, SyncRun, TierWatermarks, Timestamp,
};

use crate::error::Result;

/// The Store trait: async interface for entities, the lock and the sync log.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Idempotent upserts**: Writing the same entity twice leaves identical
///   stored state. No counters change per write.
/// - **Atomic fingerprints**: An entity's fields and fingerprint live in one
///   row and are written together.
/// - **Single lock row**: Acquisition is one atomic check-and-set.
/// - **Immutable terminal runs**: Updating a terminal run fails with
///   [`StoreError::RunFinalized`](crate::StoreError::RunFinalized).
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Entity Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Load the last-known fingerprint and active flag for the given keys.
    ///
    /// Keys with no stored row are absent from the result.
    async fn get_known(
        &self,
        kind: RecordKind,
        keys: &[NaturalKey],
    ) -> Result<BTreeMap<NaturalKey, KnownEntity>>;

    /// Load full entities for the given keys.
    async fn get_entities(
        &self,
        kind: RecordKind,
        keys: &[NaturalKey],
    ) -> Result<BTreeMap<NaturalKey, ReconciledEntity>>;

    /// Load a single entity.
    async fn get_entity(&self, kind: RecordKind, key: &NaturalKey)
        -> Result<Option<ReconciledEntity>>;

    /// List entities of a kind, ordered by key.
    async fn list_entities(&self, kind: RecordKind, active_only: bool)
        -> Result<Vec<ReconciledEntity>>;

    /// Upsert a batch of entities in one transaction.
    ///
    /// Each write sets `active`, `last_synced_at` and `last_run_id`. Either
    /// every write in the batch commits or none does.
    async fn upsert_entities(
        &self,
        writes: &[EntityWrite],
        run_id: RunId,
        now: Timestamp,
    ) -> Result<usize>;

    /// Soft-delete active entities of `kind` whose key is not in `seen`.
    ///
    /// Returns the deactivated keys.
    async fn deactivate_absent(
        &self,
        kind: RecordKind,
        seen: &BTreeSet<NaturalKey>,
        run_id: RunId,
        now: Timestamp,
    ) -> Result<Vec<NaturalKey>>;

    /// Keys of all active entities of a kind.
    async fn active_keys(&self, kind: RecordKind) -> Result<BTreeSet<NaturalKey>>;

    /// Active item keys whose quantity is at or below their reorder point.
    async fn critical_keys(&self) -> Result<BTreeSet<NaturalKey>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Lock Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Atomically acquire the singleton lock.
    ///
    /// Succeeds if no lock exists or the existing heartbeat is older than
    /// `stale_after_ms`. On reclamation the previous holder's run is marked
    /// `Stuck` in the same transaction, if it is not already terminal.
    async fn try_acquire_lock(
        &self,
        run_id: RunId,
        now: Timestamp,
        stale_after_ms: i64,
    ) -> Result<LockAcquisition>;

    /// Extend the lock. Returns `false` if `run_id` no longer holds it.
    async fn heartbeat_lock(&self, run_id: RunId, now: Timestamp) -> Result<bool>;

    /// Release the lock. Returns `false` if `run_id` was not the holder.
    async fn release_lock(&self, run_id: RunId) -> Result<bool>;

    /// The current lock, if any (stale or not).
    async fn current_lock(&self) -> Result<Option<ConcurrencyLock>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Sync Log Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a new run.
    async fn insert_run(&self, run: &SyncRun) -> Result<()>;

    /// Replace a stored run. Fails if the stored run is already terminal.
    async fn update_run(&self, run: &SyncRun) -> Result<()>;

    /// Get a run by id.
    async fn get_run(&self, id: RunId) -> Result<Option<SyncRun>>;

    /// Most recent runs, newest first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<SyncRun>>;

    /// Mark a non-terminal run `Stuck`. Returns `false` if it was terminal
    /// or unknown.
    async fn mark_run_stuck(&self, id: RunId, now: Timestamp) -> Result<bool>;

    /// Start times of the newest `Succeeded` run of each tier. Dry runs
    /// are ignored.
    async fn tier_watermarks(&self) -> Result<TierWatermarks>;
}
