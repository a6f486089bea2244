//! Material-field fingerprints.
//!
//! A fingerprint is a Blake3 digest over the canonical encoding of the
//! normalized material fields of a record. The set of material fields is a
//! versioned [`FieldProjection`]; bumping the version changes every
//! fingerprint, which forces exactly one rewrite pass over the store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_material_bytes;
use crate::record::{NormalizedValue, RemoteRecord};
use crate::types::RecordKind;

/// Domain separation tag for fingerprints.
const FINGERPRINT_DOMAIN: &[u8] = b"invsync-fingerprint-v1:";

/// The projection version shipped by default.
pub const DEFAULT_PROJECTION_VERSION: u16 = 1;

/// A 32-byte fingerprint of an entity's material fields.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Fingerprint a record under the given projection.
    pub fn compute(record: &RemoteRecord, projection: &FieldProjection) -> Self {
        Self::from_normalized(
            record.kind,
            projection.version,
            &record.normalized(&projection.fields),
        )
    }

    /// Fingerprint an already-normalized field map.
    pub fn from_normalized(
        kind: RecordKind,
        version: u16,
        fields: &BTreeMap<String, NormalizedValue>,
    ) -> Self {
        let canonical = canonical_material_bytes(kind, version, fields);
        let mut hasher = blake3::Hasher::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(&canonical);
        Self(*hasher.finalize().as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create from a byte slice, if it has the right length.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The versioned list of material fields for one record kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldProjection {
    /// Projection version, mixed into every fingerprint.
    pub version: u16,
    /// Material field names.
    pub fields: Vec<String>,
}

impl FieldProjection {
    /// Create a projection from field names.
    pub fn new(version: u16, fields: &[&str]) -> Self {
        Self {
            version,
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Whether a field is material under this projection.
    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }
}

/// Material projections for every record kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionSet {
    pub item: FieldProjection,
    pub vendor: FieldProjection,
}

impl ProjectionSet {
    /// Item material fields in the default projection.
    pub const ITEM_FIELDS: &'static [&'static str] = &[
        "quantity_on_hand",
        "unit_cost",
        "vendor_name",
        "status",
        "reorder_point",
    ];

    /// Vendor material fields in the default projection.
    pub const VENDOR_FIELDS: &'static [&'static str] = &["name", "status"];

    /// The default field lists under an explicit version.
    pub fn with_version(version: u16) -> Self {
        Self {
            item: FieldProjection::new(version, Self::ITEM_FIELDS),
            vendor: FieldProjection::new(version, Self::VENDOR_FIELDS),
        }
    }

    /// The projection for a record kind.
    pub fn for_kind(&self, kind: RecordKind) -> &FieldProjection {
        match kind {
            RecordKind::Item => &self.item,
            RecordKind::Vendor => &self.vendor,
        }
    }
}

impl Default for ProjectionSet {
    fn default() -> Self {
        Self::with_version(DEFAULT_PROJECTION_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NaturalKey;
    use proptest::prelude::*;
    use serde_json::json;

    fn item(key: &str) -> RemoteRecord {
        RemoteRecord::new(RecordKind::Item, NaturalKey::new(key).unwrap())
    }

    #[test]
    fn test_type_coercion_stable() {
        let projection = ProjectionSet::default();
        let a = item("A100")
            .with_field("quantity_on_hand", 5)
            .with_field("unit_cost", "2.50")
            .with_field("status", "active");
        let b = item("A100")
            .with_field("status", " active ")
            .with_field("unit_cost", 2.5)
            .with_field("quantity_on_hand", "5");

        assert_eq!(
            Fingerprint::compute(&a, &projection.item),
            Fingerprint::compute(&b, &projection.item)
        );
    }

    #[test]
    fn test_non_material_fields_ignored() {
        let projection = ProjectionSet::default();
        let a = item("A100").with_field("quantity_on_hand", 50);
        let b = item("A100")
            .with_field("quantity_on_hand", 50)
            .with_field("description", "blue widget")
            .modified_at(1_700_000_000_000);

        assert_eq!(
            Fingerprint::compute(&a, &projection.item),
            Fingerprint::compute(&b, &projection.item)
        );
    }

    #[test]
    fn test_material_change_detected() {
        let projection = ProjectionSet::default();
        let a = item("A100").with_field("quantity_on_hand", 50);
        let b = item("A100").with_field("quantity_on_hand", 45);

        assert_ne!(
            Fingerprint::compute(&a, &projection.item),
            Fingerprint::compute(&b, &projection.item)
        );
    }

    #[test]
    fn test_version_bump_changes_fingerprint() {
        let record = item("A100").with_field("quantity_on_hand", 50);
        let v1 = ProjectionSet::with_version(1);
        let v2 = ProjectionSet::with_version(2);

        assert_ne!(
            Fingerprint::compute(&record, &v1.item),
            Fingerprint::compute(&record, &v2.item)
        );
    }

    #[test]
    fn test_missing_equals_null_equals_empty() {
        let projection = ProjectionSet::default();
        let missing = item("A1");
        let null = item("A1").with_field("vendor_name", serde_json::Value::Null);
        let empty = item("A1").with_field("vendor_name", "");

        let fp = Fingerprint::compute(&missing, &projection.item);
        assert_eq!(fp, Fingerprint::compute(&null, &projection.item));
        assert_eq!(fp, Fingerprint::compute(&empty, &projection.item));
    }

    #[test]
    fn test_hex_and_slice() {
        let fp = Fingerprint::from_bytes([0xab; 32]);
        assert_eq!(fp.to_hex().len(), 64);
        assert_eq!(Fingerprint::from_slice(fp.as_bytes()), Some(fp));
        assert_eq!(Fingerprint::from_slice(&[0u8; 31]), None);
    }

    proptest! {
        #[test]
        fn prop_field_order_irrelevant(
            qty in 0i64..10_000,
            cost_cents in 0u32..1_000_000,
            status in "(active|inactive|discontinued)",
        ) {
            let projection = ProjectionSet::default();
            let cost = format!("{}.{:02}", cost_cents / 100, cost_cents % 100);

            let forward = item("P1")
                .with_field("quantity_on_hand", qty)
                .with_field("unit_cost", cost.clone())
                .with_field("status", status.clone());

            // Insert in reverse order with stringly-typed quantity.
            let mut reversed = item("P1");
            reversed.fields.insert("status".into(), json!(status));
            reversed.fields.insert("unit_cost".into(), json!(cost));
            reversed.fields.insert("quantity_on_hand".into(), json!(qty.to_string()));

            prop_assert_eq!(
                Fingerprint::compute(&forward, &projection.item),
                Fingerprint::compute(&reversed, &projection.item)
            );
        }
    }
}
