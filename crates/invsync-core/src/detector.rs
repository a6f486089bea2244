//! Change detection.
//!
//! The detector is a pure function of a remote record and the last-known
//! fingerprint. It performs no I/O; the reconciler loads known state and
//! passes it in.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::entity::KnownEntity;
use crate::fingerprint::{Fingerprint, ProjectionSet};
use crate::record::RemoteRecord;

/// The outcome of comparing a remote record to its last-known state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteDecision {
    /// Whether the record must be written.
    pub write: bool,
    /// The record's current fingerprint.
    pub fingerprint: Fingerprint,
}

/// Decides whether remote records differ from the stored state.
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    projections: ProjectionSet,
}

impl ChangeDetector {
    /// Create a detector using the given projections.
    pub fn new(projections: ProjectionSet) -> Self {
        Self { projections }
    }

    /// The projections in use.
    pub fn projections(&self) -> &ProjectionSet {
        &self.projections
    }

    /// Compute the fingerprint of a record.
    pub fn fingerprint(&self, remote: &RemoteRecord) -> Fingerprint {
        Fingerprint::compute(remote, self.projections.for_kind(remote.kind))
    }

    /// Decide whether `remote` must be written given the last-known fingerprint.
    pub fn should_write(
        &self,
        remote: &RemoteRecord,
        known: Option<&Fingerprint>,
    ) -> WriteDecision {
        let fingerprint = self.fingerprint(remote);
        let write = match known {
            Some(existing) => *existing != fingerprint,
            None => true,
        };
        WriteDecision { write, fingerprint }
    }

    /// Like [`should_write`](Self::should_write), but against a stored entity.
    ///
    /// An inactive entity counts as unknown, so a record that reappears is
    /// always written (and thereby re-activated).
    pub fn decide(&self, remote: &RemoteRecord, known: Option<&KnownEntity>) -> WriteDecision {
        let fingerprint = known.filter(|k| k.active).map(|k| &k.fingerprint);
        self.should_write(remote, fingerprint)
    }

    /// Overlay a partially-fetched record onto the stored field set.
    ///
    /// Fields the partial fetch did not request keep their stored values, so a
    /// narrow fetch never looks like a change to the fields it skipped.
    pub fn merge_partial(existing: &BTreeMap<String, Value>, partial: &RemoteRecord) -> RemoteRecord {
        let mut fields = existing.clone();
        for (name, value) in &partial.fields {
            fields.insert(name.clone(), value.clone());
        }
        RemoteRecord {
            kind: partial.kind,
            key: partial.key.clone(),
            fields,
            remote_modified_at: partial.remote_modified_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NaturalKey, RecordKind};

    fn a100(qty: i64) -> RemoteRecord {
        RemoteRecord::new(RecordKind::Item, NaturalKey::new("A100").unwrap())
            .with_field("quantity_on_hand", qty)
            .with_field("status", "active")
    }

    #[test]
    fn test_unknown_always_writes() {
        let detector = ChangeDetector::default();
        let decision = detector.should_write(&a100(50), None);
        assert!(decision.write);
    }

    #[test]
    fn test_a100_scenario() {
        let detector = ChangeDetector::default();

        let first = detector.should_write(&a100(50), None);
        assert!(first.write);
        let f1 = first.fingerprint;

        let second = detector.should_write(&a100(45), Some(&f1));
        assert!(second.write);
        let f2 = second.fingerprint;
        assert_ne!(f1, f2);

        let third = detector.should_write(&a100(45), Some(&f2));
        assert!(!third.write);
        assert_eq!(third.fingerprint, f2);
    }

    #[test]
    fn test_inactive_treated_as_unknown() {
        let detector = ChangeDetector::default();
        let fp = detector.fingerprint(&a100(50));

        let active = KnownEntity { fingerprint: fp, active: true };
        assert!(!detector.decide(&a100(50), Some(&active)).write);

        let inactive = KnownEntity { fingerprint: fp, active: false };
        assert!(detector.decide(&a100(50), Some(&inactive)).write);
    }

    #[test]
    fn test_merge_partial_keeps_unfetched_fields() {
        let detector = ChangeDetector::default();
        let full = a100(50)
            .with_field("unit_cost", "2.50")
            .with_field("vendor_name", "Acme");
        let stored_fp = detector.fingerprint(&full);

        // Inventory-only fetch: same stock, no cost or vendor.
        let partial = RemoteRecord::new(RecordKind::Item, NaturalKey::new("A100").unwrap())
            .with_field("quantity_on_hand", "50")
            .with_field("status", "active");

        // Without merging, the missing fields would look like a change.
        assert!(detector.should_write(&partial, Some(&stored_fp)).write);

        let merged = ChangeDetector::merge_partial(&full.fields, &partial);
        assert!(!detector.should_write(&merged, Some(&stored_fp)).write);
        assert_eq!(merged.field("vendor_name"), Some(&Value::from("Acme")));
    }

    #[test]
    fn test_merge_partial_applies_new_values() {
        let detector = ChangeDetector::default();
        let full = a100(50).with_field("unit_cost", "2.50");
        let stored_fp = detector.fingerprint(&full);

        let partial = RemoteRecord::new(RecordKind::Item, NaturalKey::new("A100").unwrap())
            .with_field("quantity_on_hand", 45);
        let merged = ChangeDetector::merge_partial(&full.fields, &partial);

        assert!(detector.should_write(&merged, Some(&stored_fp)).write);
        assert_eq!(merged.numeric_field("quantity_on_hand"), Some(45.0));
        assert_eq!(merged.numeric_field("unit_cost"), Some(2.5));
    }
}
