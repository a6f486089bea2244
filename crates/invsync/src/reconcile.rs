//! The reconciler: turns remote records into idempotent store writes.
//!
//! Planning and applying are separate steps. [`Reconciler::plan`] is a read
//! plus pure change detection; [`Reconciler::apply`] is one store transaction
//! per batch. The orchestrator puts the batch processor between the two.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, warn};

use invsync_core::{
    ChangeDetector, EntityWrite, FieldScope, Fingerprint, KnownEntity, NaturalKey, RecordKind,
    RemoteRecord, RunId, SyncScope, Timestamp,
};
use invsync_store::Store;

use crate::cache::SnapshotCache;
use crate::error::Result;

/// What to do with one remote record.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// The record to write, with partial fetches merged onto stored fields.
    pub record: RemoteRecord,
    pub fingerprint: Fingerprint,
    /// Whether the record differs from the stored state.
    pub write: bool,
}

impl Decision {
    pub fn key(&self) -> &NaturalKey {
        &self.record.key
    }

    fn to_write(&self) -> EntityWrite {
        EntityWrite::from_record(&self.record, self.fingerprint)
    }
}

/// Applies change decisions to the store and the optional snapshot cache.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    detector: ChangeDetector,
    cache: Option<Arc<dyn SnapshotCache>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, detector: ChangeDetector) -> Self {
        Self {
            store,
            detector,
            cache: None,
        }
    }

    /// Write through to `cache` after every committed batch.
    pub fn with_cache(mut self, cache: Arc<dyn SnapshotCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    /// Decide which records must be written.
    ///
    /// Records are deduplicated by key (the last occurrence wins) and returned
    /// in key order. For a partial field scope the fetched fields are merged
    /// onto the stored ones before fingerprinting.
    pub async fn plan(
        &self,
        kind: RecordKind,
        records: Vec<RemoteRecord>,
        fields: &FieldScope,
    ) -> Result<Vec<Decision>> {
        let mut by_key: BTreeMap<NaturalKey, RemoteRecord> = BTreeMap::new();
        for record in records.into_iter().filter(|r| r.kind == kind) {
            by_key.insert(record.key.clone(), record);
        }
        if by_key.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<NaturalKey> = by_key.keys().cloned().collect();

        let decisions = if fields.is_partial() {
            let stored = self.store.get_entities(kind, &keys).await?;
            by_key
                .into_values()
                .map(|record| {
                    let existing = stored.get(&record.key);
                    let merged = match existing {
                        Some(entity) => ChangeDetector::merge_partial(&entity.fields, &record),
                        None => record,
                    };
                    let known = existing.map(|e| e.known());
                    self.decide(merged, known.as_ref())
                })
                .collect()
        } else {
            let known = self.store.get_known(kind, &keys).await?;
            by_key
                .into_values()
                .map(|record| {
                    let k = known.get(&record.key).copied();
                    self.decide(record, k.as_ref())
                })
                .collect()
        };
        Ok(decisions)
    }

    fn decide(&self, record: RemoteRecord, known: Option<&KnownEntity>) -> Decision {
        let decision = self.detector.decide(&record, known);
        Decision {
            record,
            fingerprint: decision.fingerprint,
            write: decision.write,
        }
    }

    /// Upsert the decisions that need a write, in one transaction.
    ///
    /// Returns the number of entities written. In dry-run mode nothing is
    /// written and the count is zero.
    pub async fn apply(
        &self,
        decisions: &[Decision],
        run_id: RunId,
        now: Timestamp,
        dry_run: bool,
    ) -> Result<usize> {
        let writes: Vec<EntityWrite> = decisions.iter().filter(|d| d.write).map(Decision::to_write).collect();
        if writes.is_empty() || dry_run {
            return Ok(0);
        }

        let written = self.store.upsert_entities(&writes, run_id, now).await?;
        debug!(written, "batch committed");

        if let Some(cache) = &self.cache {
            let entities: Vec<_> = writes.into_iter().map(|w| w.into_entity(run_id, now)).collect();
            if let Err(e) = cache.put_many(&entities).await {
                warn!(error = %e, entities = entities.len(), "snapshot cache write-through failed");
            }
        }
        Ok(written)
    }

    /// Soft-delete active entities that a complete full listing did not report.
    ///
    /// A no-op unless the scope allows deactivation and the listing for
    /// `kind` was complete. In dry-run mode the keys are computed but nothing
    /// is written.
    #[allow(clippy::too_many_arguments)]
    pub async fn deactivate_absent(
        &self,
        kind: RecordKind,
        seen: &BTreeSet<NaturalKey>,
        scope: &SyncScope,
        listing_complete: bool,
        run_id: RunId,
        now: Timestamp,
        dry_run: bool,
    ) -> Result<Vec<NaturalKey>> {
        if !scope.deactivate_missing || !listing_complete {
            return Ok(Vec::new());
        }

        if dry_run {
            let active = self.store.active_keys(kind).await?;
            return Ok(active.difference(seen).cloned().collect());
        }

        let keys = self.store.deactivate_absent(kind, seen, run_id, now).await?;
        if !keys.is_empty() {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.deactivate(kind, &keys).await {
                    warn!(error = %e, "snapshot cache deactivation failed");
                }
            }
        }
        Ok(keys)
    }

    /// Repopulate the snapshot cache from the store. Returns the entry count.
    pub async fn rebuild_cache(&self) -> Result<usize> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };
        cache.clear().await?;
        let mut total = 0;
        for kind in RecordKind::ALL {
            let entities = self.store.list_entities(kind, false).await?;
            total += entities.len();
            cache.put_many(&entities).await?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemorySnapshotCache;
    use invsync_core::{ProjectionSet, StrategyContext, SyncTier};
    use invsync_store::MemoryStore;

    fn key(s: &str) -> NaturalKey {
        NaturalKey::new(s).unwrap()
    }

    fn item(k: &str, qty: i64) -> RemoteRecord {
        RemoteRecord::new(RecordKind::Item, key(k))
            .with_field("quantity_on_hand", qty)
            .with_field("reorder_point", 10)
            .with_field("unit_cost", "2.50")
            .with_field("status", "active")
    }

    fn setup() -> (Arc<MemoryStore>, Arc<MemorySnapshotCache>, Reconciler) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemorySnapshotCache::new());
        let reconciler = Reconciler::new(store.clone(), ChangeDetector::new(ProjectionSet::default()))
            .with_cache(cache.clone());
        (store, cache, reconciler)
    }

    async fn sync(reconciler: &Reconciler, records: Vec<RemoteRecord>, fields: &FieldScope) -> usize {
        let decisions = reconciler.plan(RecordKind::Item, records, fields).await.unwrap();
        reconciler
            .apply(&decisions, RunId::generate(), 1_000, false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_second_pass_writes_nothing() {
        let (store, _, reconciler) = setup();
        let records = vec![item("A1", 5), item("A2", 50)];

        assert_eq!(sync(&reconciler, records.clone(), &FieldScope::All).await, 2);
        assert_eq!(sync(&reconciler, records, &FieldScope::All).await, 0);
        assert_eq!(store.list_entities(RecordKind::Item, true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_plan_dedupes_last_wins() {
        let (_, _, reconciler) = setup();
        let decisions = reconciler
            .plan(
                RecordKind::Item,
                vec![item("B2", 1), item("A1", 1), item("B2", 9)],
                &FieldScope::All,
            )
            .await
            .unwrap();

        let keys: Vec<&str> = decisions.iter().map(|d| d.key().as_str()).collect();
        assert_eq!(keys, vec!["A1", "B2"]);
        assert_eq!(decisions[1].record.numeric_field("quantity_on_hand"), Some(9.0));
    }

    #[tokio::test]
    async fn test_partial_scope_merges_stored_fields() {
        let (store, _, reconciler) = setup();
        sync(&reconciler, vec![item("A1", 5)], &FieldScope::All).await;

        // Same stock, no unit_cost in the partial fetch: not a change.
        let partial = RemoteRecord::new(RecordKind::Item, key("A1"))
            .with_field("quantity_on_hand", "5")
            .with_field("reorder_point", 10)
            .with_field("status", "active");
        assert_eq!(sync(&reconciler, vec![partial.clone()], &FieldScope::inventory()).await, 0);

        // Stock changed: written, unit_cost preserved.
        let changed = partial.with_field("quantity_on_hand", 3);
        assert_eq!(sync(&reconciler, vec![changed], &FieldScope::inventory()).await, 1);
        let stored = store.get_entity(RecordKind::Item, &key("A1")).await.unwrap().unwrap();
        assert_eq!(stored.quantity_on_hand, Some(3.0));
        assert_eq!(stored.fields.get("unit_cost"), Some(&serde_json::json!("2.50")));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (store, cache, reconciler) = setup();
        let decisions = reconciler
            .plan(RecordKind::Item, vec![item("A1", 5)], &FieldScope::All)
            .await
            .unwrap();
        assert!(decisions[0].write);

        let written = reconciler
            .apply(&decisions, RunId::generate(), 1_000, true)
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert!(store.get_entity(RecordKind::Item, &key("A1")).await.unwrap().is_none());
        assert_eq!(cache.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deactivation_requires_full_and_complete() {
        let (store, cache, reconciler) = setup();
        sync(&reconciler, vec![item("A1", 5), item("A2", 5)], &FieldScope::All).await;

        let ctx = StrategyContext::default();
        let full = SyncScope::for_tier(SyncTier::Full, &ctx);
        let inventory = SyncScope::for_tier(SyncTier::InventoryOnly, &ctx);
        let seen: BTreeSet<NaturalKey> = [key("A1")].into_iter().collect();
        let run = RunId::generate();

        let none = reconciler
            .deactivate_absent(RecordKind::Item, &seen, &inventory, true, run, 2_000, false)
            .await
            .unwrap();
        assert!(none.is_empty());

        let incomplete = reconciler
            .deactivate_absent(RecordKind::Item, &seen, &full, false, run, 2_000, false)
            .await
            .unwrap();
        assert!(incomplete.is_empty());

        let dry = reconciler
            .deactivate_absent(RecordKind::Item, &seen, &full, true, run, 2_000, true)
            .await
            .unwrap();
        assert_eq!(dry, vec![key("A2")]);
        assert_eq!(store.active_keys(RecordKind::Item).await.unwrap().len(), 2);

        let gone = reconciler
            .deactivate_absent(RecordKind::Item, &seen, &full, true, run, 2_000, false)
            .await
            .unwrap();
        assert_eq!(gone, vec![key("A2")]);
        let cached = cache.get(RecordKind::Item, &key("A2")).await.unwrap().unwrap();
        assert!(!cached.active);
    }

    #[tokio::test]
    async fn test_rebuild_cache() {
        let (_, cache, reconciler) = setup();
        sync(&reconciler, vec![item("A1", 5), item("A2", 5)], &FieldScope::All).await;
        cache.clear().await.unwrap();

        assert_eq!(reconciler.rebuild_cache().await.unwrap(), 2);
        assert_eq!(cache.len().await.unwrap(), 2);
    }
}
