//! Reconciled entities: the local store's view of a natural key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fingerprint::Fingerprint;
use crate::record::RemoteRecord;
use crate::types::{NaturalKey, RecordKind, RunId, Timestamp};

/// A row of the reconciled store.
///
/// Entity fields and fingerprint are always written together, so a stored
/// fingerprint never describes fields that were not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledEntity {
    pub kind: RecordKind,
    pub key: NaturalKey,
    /// Full field set as last written, including non-material fields.
    pub fields: BTreeMap<String, Value>,
    pub fingerprint: Fingerprint,
    /// Soft-delete flag. Cleared when a full listing no longer reports the key.
    pub active: bool,
    pub last_synced_at: Timestamp,
    /// The run that last wrote this row.
    pub last_run_id: RunId,
    /// Extracted stock level, for reorder queries.
    pub quantity_on_hand: Option<f64>,
    /// Extracted reorder threshold, for reorder queries.
    pub reorder_point: Option<f64>,
}

impl ReconciledEntity {
    /// Whether this entity is active and at or below its reorder point.
    pub fn is_critical(&self) -> bool {
        match (self.quantity_on_hand, self.reorder_point) {
            (Some(qty), Some(reorder)) => self.active && qty <= reorder,
            _ => false,
        }
    }

    /// The last-known state as seen by the change detector.
    pub fn known(&self) -> KnownEntity {
        KnownEntity {
            fingerprint: self.fingerprint,
            active: self.active,
        }
    }
}

/// What the change detector needs to know about a stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownEntity {
    pub fingerprint: Fingerprint,
    pub active: bool,
}

/// A single idempotent upsert, keyed by `(kind, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityWrite {
    pub kind: RecordKind,
    pub key: NaturalKey,
    pub fields: BTreeMap<String, Value>,
    pub fingerprint: Fingerprint,
    pub quantity_on_hand: Option<f64>,
    pub reorder_point: Option<f64>,
}

impl EntityWrite {
    /// Build a write from a (possibly merged) remote record.
    pub fn from_record(record: &RemoteRecord, fingerprint: Fingerprint) -> Self {
        let (quantity_on_hand, reorder_point) = match record.kind {
            RecordKind::Item => (
                record.numeric_field("quantity_on_hand"),
                record.numeric_field("reorder_point"),
            ),
            RecordKind::Vendor => (None, None),
        };

        Self {
            kind: record.kind,
            key: record.key.clone(),
            fields: record.fields.clone(),
            fingerprint,
            quantity_on_hand,
            reorder_point,
        }
    }

    /// The stored row this write produces.
    pub fn into_entity(self, run_id: RunId, now: Timestamp) -> ReconciledEntity {
        ReconciledEntity {
            kind: self.kind,
            key: self.key,
            fields: self.fields,
            fingerprint: self.fingerprint,
            active: true,
            last_synced_at: now,
            last_run_id: run_id,
            quantity_on_hand: self.quantity_on_hand,
            reorder_point: self.reorder_point,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_extracts_stock_levels() {
        let record = RemoteRecord::new(RecordKind::Item, NaturalKey::new("A100").unwrap())
            .with_field("quantity_on_hand", "3")
            .with_field("reorder_point", 5);
        let write = EntityWrite::from_record(&record, Fingerprint::from_bytes([1; 32]));
        assert_eq!(write.quantity_on_hand, Some(3.0));
        assert_eq!(write.reorder_point, Some(5.0));

        let entity = write.into_entity(RunId::from_bytes([2; 16]), 1000);
        assert!(entity.active);
        assert!(entity.is_critical());
        assert_eq!(entity.last_synced_at, 1000);
    }

    #[test]
    fn test_vendor_has_no_stock_levels() {
        let record = RemoteRecord::new(RecordKind::Vendor, NaturalKey::new("V1").unwrap())
            .with_field("quantity_on_hand", 3);
        let write = EntityWrite::from_record(&record, Fingerprint::from_bytes([1; 32]));
        assert_eq!(write.quantity_on_hand, None);
        assert!(!write.into_entity(RunId::generate(), 0).is_critical());
    }

    #[test]
    fn test_inactive_is_never_critical() {
        let record = RemoteRecord::new(RecordKind::Item, NaturalKey::new("A1").unwrap())
            .with_field("quantity_on_hand", 0)
            .with_field("reorder_point", 10);
        let mut entity = EntityWrite::from_record(&record, Fingerprint::from_bytes([0; 32]))
            .into_entity(RunId::generate(), 0);
        entity.active = false;
        assert!(!entity.is_critical());
    }
}
