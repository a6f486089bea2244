//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{json, Value};

use invsync_core::{NaturalKey, RecordKind, RemoteRecord, Timestamp};

/// Generate a SKU.
pub fn sku() -> impl Strategy<Value = NaturalKey> {
    "[A-Z]{1,3}-[0-9]{1,5}".prop_map(|s| NaturalKey::new(s).expect("pattern is non-empty"))
}

/// Generate a reasonable timestamp.
pub fn timestamp() -> impl Strategy<Value = Timestamp> {
    0i64..=1_900_000_000_000i64
}

/// Generate a record status.
pub fn status() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("active"), Just("inactive"), Just("discontinued")]
}

/// The ways a remote API spells the same integer.
pub fn integer_repr(n: i64) -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(json!(n)),
        Just(json!(n.to_string())),
        Just(json!(n as f64)),
        Just(json!(format!("{}.0", n))),
        Just(json!(format!(" {} ", n))),
    ]
}

/// The ways a remote API spells the same price in cents.
pub fn price_repr(cents: u32) -> impl Strategy<Value = Value> {
    let text = format!("{}.{:02}", cents / 100, cents % 100);
    prop_oneof![
        Just(json!(text.clone())),
        Just(json!(f64::from(cents) / 100.0)),
        Just(json!(format!("{}0", text))),
    ]
}

/// Parameters for generating an item.
#[derive(Debug, Clone)]
pub struct ItemParams {
    pub sku: NaturalKey,
    pub quantity: i64,
    pub reorder_point: i64,
    pub unit_cost_cents: u32,
    pub status: &'static str,
    pub modified_at: Timestamp,
}

impl Arbitrary for ItemParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            sku(),
            0i64..=100_000i64,
            0i64..=500i64,
            0u32..=1_000_000u32,
            status(),
            timestamp(),
        )
            .prop_map(|(sku, quantity, reorder_point, unit_cost_cents, status, modified_at)| {
                ItemParams {
                    sku,
                    quantity,
                    reorder_point,
                    unit_cost_cents,
                    status,
                    modified_at,
                }
            })
            .boxed()
    }
}

/// An item record for `params`, with every value spelled in some
/// representation the remote might use, plus an unknown extra field.
pub fn item_spellings(params: ItemParams) -> impl Strategy<Value = RemoteRecord> {
    (
        integer_repr(params.quantity),
        integer_repr(params.reorder_point),
        price_repr(params.unit_cost_cents),
        any::<bool>(),
        "[a-z]{0,12}",
    )
        .prop_map(move |(quantity, reorder_point, cost, padded, extra)| {
            let status = if padded {
                format!("  {}  ", params.status)
            } else {
                params.status.to_string()
            };
            RemoteRecord::new(RecordKind::Item, params.sku.clone())
                .with_field("quantity_on_hand", quantity)
                .with_field("reorder_point", reorder_point)
                .with_field("unit_cost", cost)
                .with_field("status", status)
                .with_field("warehouse_note", extra)
                .modified_at(params.modified_at)
        })
}

/// Generate an item record in some remote spelling.
pub fn item_record() -> impl Strategy<Value = RemoteRecord> {
    any::<ItemParams>().prop_flat_map(item_spellings)
}

/// Generate a batch of item records that may repeat keys.
pub fn item_batch(max: usize) -> impl Strategy<Value = Vec<RemoteRecord>> {
    prop::collection::vec(item_record(), 0..=max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use invsync_core::{ChangeDetector, KnownEntity, ProjectionSet, DEFAULT_PROJECTION_VERSION};

    fn detector() -> ChangeDetector {
        ChangeDetector::new(ProjectionSet::default())
    }

    proptest! {
        #[test]
        fn test_fingerprint_ignores_spelling(
            (a, b) in any::<ItemParams>().prop_flat_map(|p| (item_spellings(p.clone()), item_spellings(p)))
        ) {
            let detector = detector();
            prop_assert_eq!(detector.fingerprint(&a), detector.fingerprint(&b));
        }

        #[test]
        fn test_stock_change_changes_fingerprint(params: ItemParams, delta in 1i64..1_000) {
            let detector = detector();
            let before = RemoteRecord::new(RecordKind::Item, params.sku.clone())
                .with_field("quantity_on_hand", params.quantity);
            let after = before.clone().with_field("quantity_on_hand", params.quantity + delta);
            prop_assert_ne!(detector.fingerprint(&before), detector.fingerprint(&after));
        }

        #[test]
        fn test_known_fingerprint_means_no_write(record in item_record()) {
            let detector = detector();
            let fingerprint = detector.fingerprint(&record);
            let known = KnownEntity { fingerprint, active: true };
            prop_assert!(!detector.decide(&record, Some(&known)).write);

            let inactive = KnownEntity { fingerprint, active: false };
            prop_assert!(detector.decide(&record, Some(&inactive)).write);
        }

        #[test]
        fn test_projection_bump_changes_every_fingerprint(record in item_record()) {
            let v1 = detector();
            let v2 = ChangeDetector::new(ProjectionSet::with_version(DEFAULT_PROJECTION_VERSION + 1));
            prop_assert_ne!(v1.fingerprint(&record), v2.fingerprint(&record));
        }
    }
}
