//! Snapshot cache: a derived, rebuildable read view of the reconciled store.
//!
//! The reconciler writes through to the cache after each committed batch.
//! The store remains the system of record; a cache failure is logged and
//! never fails a batch.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use invsync_core::{NaturalKey, ReconciledEntity, RecordKind};

use crate::error::{EngineError, Result};

/// A write-through target for reconciled entities.
#[async_trait]
pub trait SnapshotCache: Send + Sync {
    /// Insert or replace entities.
    async fn put_many(&self, entities: &[ReconciledEntity]) -> Result<()>;

    /// Mark entities inactive.
    async fn deactivate(&self, kind: RecordKind, keys: &[NaturalKey]) -> Result<()>;

    /// Drop every entry.
    async fn clear(&self) -> Result<()>;

    async fn get(&self, kind: RecordKind, key: &NaturalKey) -> Result<Option<ReconciledEntity>>;

    async fn len(&self) -> Result<usize>;
}

/// An in-process snapshot cache.
#[derive(Debug, Default)]
pub struct MemorySnapshotCache {
    entries: RwLock<HashMap<(RecordKind, NaturalKey), ReconciledEntity>>,
}

impl MemorySnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(e: impl std::fmt::Display) -> EngineError {
    EngineError::Cache(format!("lock poisoned: {}", e))
}

#[async_trait]
impl SnapshotCache for MemorySnapshotCache {
    async fn put_many(&self, entities: &[ReconciledEntity]) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        for entity in entities {
            entries.insert((entity.kind, entity.key.clone()), entity.clone());
        }
        Ok(())
    }

    async fn deactivate(&self, kind: RecordKind, keys: &[NaturalKey]) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        for key in keys {
            if let Some(entity) = entries.get_mut(&(kind, key.clone())) {
                entity.active = false;
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().map_err(poisoned)?.clear();
        Ok(())
    }

    async fn get(&self, kind: RecordKind, key: &NaturalKey) -> Result<Option<ReconciledEntity>> {
        Ok(self
            .entries
            .read()
            .map_err(poisoned)?
            .get(&(kind, key.clone()))
            .cloned())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().map_err(poisoned)?.len())
    }
}
