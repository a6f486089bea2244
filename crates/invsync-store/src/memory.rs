//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use invsync_core::{
    ConcurrencyLock, EntityWrite, KnownEntity, LockAcquisition, NaturalKey, ReconciledEntity,
    RecordKind, RunId, RunStatus, SyncRun, TierWatermarks, Timestamp,
};

use crate::error::{Result, StoreError};
use crate::traits::Store;

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock; every
/// operation takes the lock once, so each is atomic.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Entities indexed by (kind, key).
    entities: BTreeMap<(RecordKind, NaturalKey), ReconciledEntity>,

    /// The singleton lock row.
    lock: Option<ConcurrencyLock>,

    /// Runs indexed by id.
    runs: HashMap<RunId, SyncRun>,

    /// Run ids in insertion order.
    run_order: Vec<RunId>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner.read().map_err(StoreError::poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner.write().map_err(StoreError::poisoned)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_known(
        &self,
        kind: RecordKind,
        keys: &[NaturalKey],
    ) -> Result<BTreeMap<NaturalKey, KnownEntity>> {
        let inner = self.read()?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                inner
                    .entities
                    .get(&(kind, key.clone()))
                    .map(|e| (key.clone(), e.known()))
            })
            .collect())
    }

    async fn get_entities(
        &self,
        kind: RecordKind,
        keys: &[NaturalKey],
    ) -> Result<BTreeMap<NaturalKey, ReconciledEntity>> {
        let inner = self.read()?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                inner
                    .entities
                    .get(&(kind, key.clone()))
                    .map(|e| (key.clone(), e.clone()))
            })
            .collect())
    }

    async fn get_entity(
        &self,
        kind: RecordKind,
        key: &NaturalKey,
    ) -> Result<Option<ReconciledEntity>> {
        let inner = self.read()?;
        Ok(inner.entities.get(&(kind, key.clone())).cloned())
    }

    async fn list_entities(
        &self,
        kind: RecordKind,
        active_only: bool,
    ) -> Result<Vec<ReconciledEntity>> {
        let inner = self.read()?;
        Ok(inner
            .entities
            .values()
            .filter(|e| e.kind == kind && (!active_only || e.active))
            .cloned()
            .collect())
    }

    async fn upsert_entities(
        &self,
        writes: &[EntityWrite],
        run_id: RunId,
        now: Timestamp,
    ) -> Result<usize> {
        let mut inner = self.write()?;
        for write in writes {
            let entity = write.clone().into_entity(run_id, now);
            inner
                .entities
                .insert((entity.kind, entity.key.clone()), entity);
        }
        Ok(writes.len())
    }

    async fn deactivate_absent(
        &self,
        kind: RecordKind,
        seen: &BTreeSet<NaturalKey>,
        run_id: RunId,
        now: Timestamp,
    ) -> Result<Vec<NaturalKey>> {
        let mut inner = self.write()?;
        let mut deactivated = Vec::new();
        for entity in inner.entities.values_mut() {
            if entity.kind == kind && entity.active && !seen.contains(&entity.key) {
                entity.active = false;
                entity.last_synced_at = now;
                entity.last_run_id = run_id;
                deactivated.push(entity.key.clone());
            }
        }
        Ok(deactivated)
    }

    async fn active_keys(&self, kind: RecordKind) -> Result<BTreeSet<NaturalKey>> {
        let inner = self.read()?;
        Ok(inner
            .entities
            .values()
            .filter(|e| e.kind == kind && e.active)
            .map(|e| e.key.clone())
            .collect())
    }

    async fn critical_keys(&self) -> Result<BTreeSet<NaturalKey>> {
        let inner = self.read()?;
        Ok(inner
            .entities
            .values()
            .filter(|e| e.kind == RecordKind::Item && e.is_critical())
            .map(|e| e.key.clone())
            .collect())
    }

    async fn try_acquire_lock(
        &self,
        run_id: RunId,
        now: Timestamp,
        stale_after_ms: i64,
    ) -> Result<LockAcquisition> {
        let mut inner = self.write()?;

        let outcome = match inner.lock {
            None => LockAcquisition::Acquired,
            Some(existing) if existing.is_stale(now, stale_after_ms) => {
                LockAcquisition::Reclaimed { previous: existing }
            }
            Some(existing) => return Ok(LockAcquisition::Contended { holder: existing }),
        };

        inner.lock = Some(ConcurrencyLock::new(run_id, now));

        if let LockAcquisition::Reclaimed { previous } = outcome {
            if let Some(run) = inner.runs.get_mut(&previous.holder) {
                if !run.is_terminal() {
                    run.finish(
                        RunStatus::Stuck,
                        now,
                        Some(format!("lock reclaimed by run {}", run_id)),
                    );
                }
            }
        }

        Ok(outcome)
    }

    async fn heartbeat_lock(&self, run_id: RunId, now: Timestamp) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.lock.as_mut() {
            Some(lock) if lock.holder == run_id => {
                lock.heartbeat_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, run_id: RunId) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.lock {
            Some(lock) if lock.holder == run_id => {
                inner.lock = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_lock(&self) -> Result<Option<ConcurrencyLock>> {
        Ok(self.read()?.lock)
    }

    async fn insert_run(&self, run: &SyncRun) -> Result<()> {
        let mut inner = self.write()?;
        if inner.runs.contains_key(&run.id) {
            return Err(StoreError::InvalidData(format!("run {} already exists", run.id)));
        }
        inner.runs.insert(run.id, run.clone());
        inner.run_order.push(run.id);
        Ok(())
    }

    async fn update_run(&self, run: &SyncRun) -> Result<()> {
        let mut inner = self.write()?;
        match inner.runs.get_mut(&run.id) {
            None => Err(StoreError::RunNotFound(run.id.to_string())),
            Some(stored) if stored.is_terminal() => {
                Err(StoreError::RunFinalized(run.id.to_string()))
            }
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
        }
    }

    async fn get_run(&self, id: RunId) -> Result<Option<SyncRun>> {
        Ok(self.read()?.runs.get(&id).cloned())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<SyncRun>> {
        let inner = self.read()?;
        let mut runs: Vec<SyncRun> = inner
            .run_order
            .iter()
            .filter_map(|id| inner.runs.get(id).cloned())
            .collect();
        // Newest first; insertion order breaks ties.
        runs.reverse();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn mark_run_stuck(&self, id: RunId, now: Timestamp) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.runs.get_mut(&id) {
            Some(run) if !run.is_terminal() => {
                run.finish(RunStatus::Stuck, now, Some("run abandoned".into()));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn tier_watermarks(&self) -> Result<TierWatermarks> {
        let inner = self.read()?;
        let mut watermarks = TierWatermarks::default();
        for run in inner.runs.values() {
            if run.status == RunStatus::Succeeded && !run.dry_run {
                if let Some(tier) = run.tier {
                    watermarks.record(tier, run.started_at);
                }
            }
        }
        Ok(watermarks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invsync_core::{Fingerprint, RemoteRecord, SyncStrategy, SyncTier};

    fn key(s: &str) -> NaturalKey {
        NaturalKey::new(s).unwrap()
    }

    fn item_write(sku: &str, qty: i64, reorder: i64) -> EntityWrite {
        let record = RemoteRecord::new(RecordKind::Item, key(sku))
            .with_field("quantity_on_hand", qty)
            .with_field("reorder_point", reorder);
        EntityWrite::from_record(&record, Fingerprint::from_bytes([qty as u8; 32]))
    }

    #[tokio::test]
    async fn test_upsert_idempotent() {
        let store = MemoryStore::new();
        let run = RunId::generate();
        let writes = vec![item_write("A100", 50, 10)];

        store.upsert_entities(&writes, run, 1000).await.unwrap();
        let first = store.get_entity(RecordKind::Item, &key("A100")).await.unwrap();
        store.upsert_entities(&writes, run, 1000).await.unwrap();
        let second = store.get_entity(RecordKind::Item, &key("A100")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.list_entities(RecordKind::Item, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_critical_keys_and_deactivation() {
        let store = MemoryStore::new();
        let run = RunId::generate();
        store
            .upsert_entities(
                &[item_write("A1", 2, 5), item_write("A2", 50, 5), item_write("A3", 5, 5)],
                run,
                0,
            )
            .await
            .unwrap();

        let critical = store.critical_keys().await.unwrap();
        assert_eq!(critical, [key("A1"), key("A3")].into_iter().collect());

        let seen: BTreeSet<_> = [key("A2"), key("A3")].into_iter().collect();
        let gone = store
            .deactivate_absent(RecordKind::Item, &seen, run, 10)
            .await
            .unwrap();
        assert_eq!(gone, vec![key("A1")]);
        assert_eq!(store.critical_keys().await.unwrap(), [key("A3")].into_iter().collect());
    }

    #[tokio::test]
    async fn test_lock_lifecycle() {
        let store = MemoryStore::new();
        let a = RunId::generate();
        let b = RunId::generate();

        assert_eq!(store.try_acquire_lock(a, 0, 100).await.unwrap(), LockAcquisition::Acquired);
        assert!(matches!(
            store.try_acquire_lock(b, 50, 100).await.unwrap(),
            LockAcquisition::Contended { .. }
        ));
        assert!(store.heartbeat_lock(a, 80).await.unwrap());
        assert!(!store.heartbeat_lock(b, 80).await.unwrap());
        assert!(!store.release_lock(b).await.unwrap());
        assert!(store.release_lock(a).await.unwrap());
        assert!(store.current_lock().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reclaim_marks_previous_run_stuck() {
        let store = MemoryStore::new();
        let mut abandoned = SyncRun::new(RunId::generate(), Some(SyncStrategy::Full), false, 0);
        abandoned.status = RunStatus::Running;
        store.insert_run(&abandoned).await.unwrap();
        store.try_acquire_lock(abandoned.id, 0, 100).await.unwrap();

        let next = RunId::generate();
        let outcome = store.try_acquire_lock(next, 500, 100).await.unwrap();
        assert!(matches!(outcome, LockAcquisition::Reclaimed { previous } if previous.holder == abandoned.id));

        let stored = store.get_run(abandoned.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Stuck);
        assert_eq!(store.current_lock().await.unwrap().map(|l| l.holder), Some(next));
    }

    #[tokio::test]
    async fn test_terminal_run_is_immutable() {
        let store = MemoryStore::new();
        let mut run = SyncRun::new(RunId::generate(), Some(SyncStrategy::Full), false, 0);
        store.insert_run(&run).await.unwrap();

        run.tier = Some(SyncTier::Full);
        run.finish(RunStatus::Succeeded, 10, None);
        store.update_run(&run).await.unwrap();

        run.counts.written = 99;
        assert!(matches!(
            store.update_run(&run).await,
            Err(StoreError::RunFinalized(_))
        ));
        assert!(!store.mark_run_stuck(run.id, 20).await.unwrap());
    }

    #[tokio::test]
    async fn test_watermarks_only_count_success() {
        let store = MemoryStore::new();
        for (started, status, tier) in [
            (100, RunStatus::Succeeded, SyncTier::Full),
            (200, RunStatus::PartialFailure, SyncTier::Full),
            (300, RunStatus::Succeeded, SyncTier::CriticalOnly),
        ] {
            let mut run = SyncRun::new(RunId::generate(), None, false, started);
            run.tier = Some(tier);
            run.status = status;
            store.insert_run(&run).await.unwrap();
        }

        let wm = store.tier_watermarks().await.unwrap();
        assert_eq!(wm.full, Some(100));
        assert_eq!(wm.critical_only, Some(300));
        assert_eq!(wm.incremental, None);
        assert_eq!(store.list_runs(2).await.unwrap()[0].started_at, 300);
    }
}
