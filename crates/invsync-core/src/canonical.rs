//! Canonical CBOR encoding of material fields.
//!
//! This module implements the subset of RFC 8949 Core Deterministic Encoding
//! needed for fingerprints:
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//! - No floats (numbers are carried as canonical decimal strings under a tag)
//!
//! The canonical encoding is what makes fingerprints stable: the same material
//! fields produce identical bytes regardless of the order or representation
//! in which the remote source reported them.

use std::collections::BTreeMap;

use ciborium::value::Value;

use crate::record::NormalizedValue;
use crate::types::RecordKind;

/// Envelope field keys (integer keys for compact encoding).
///
/// Keys 0-23 encode as single bytes in CBOR.
mod keys {
    pub const VERSION: u64 = 0;
    pub const KIND: u64 = 1;
    pub const FIELDS: u64 = 2;
}

/// CBOR tag for decimal numbers carried as canonical strings.
const TAG_DECIMAL: u64 = 4;

/// CBOR tag for opaque JSON (arrays/objects).
const TAG_JSON: u64 = 262;

/// Encode the material projection of a record to canonical CBOR bytes.
///
/// Layout: `{0: projection_version, 1: kind_tag, 2: {field: value, ...}}`.
pub fn canonical_material_bytes(
    kind: RecordKind,
    projection_version: u16,
    fields: &BTreeMap<String, NormalizedValue>,
) -> Vec<u8> {
    let field_entries: Vec<(Value, Value)> = fields
        .iter()
        .map(|(name, value)| (Value::Text(name.clone()), normalized_to_cbor(value)))
        .collect();

    let envelope = Value::Map(vec![
        (
            Value::Integer(keys::VERSION.into()),
            Value::Integer(projection_version.into()),
        ),
        (
            Value::Integer(keys::KIND.into()),
            Value::Integer(kind.tag().into()),
        ),
        (Value::Integer(keys::FIELDS.into()), Value::Map(field_entries)),
    ]);

    let mut buf = Vec::new();
    encode_value_to(&mut buf, &envelope);
    buf
}

/// Convert a normalized value to a CBOR value.
fn normalized_to_cbor(value: &NormalizedValue) -> Value {
    match value {
        NormalizedValue::Null => Value::Null,
        NormalizedValue::Bool(b) => Value::Bool(*b),
        NormalizedValue::Number(d) => Value::Tag(TAG_DECIMAL, Box::new(Value::Text(d.clone()))),
        NormalizedValue::Text(s) => Value::Text(s.clone()),
        NormalizedValue::Opaque(json) => Value::Tag(TAG_JSON, Box::new(Value::Text(json.clone()))),
    }
}


/// Only the shapes produced by [`normalized_to_cbor`] and the envelope are
/// reachable; anything else encodes as null.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Text(s) => {
            encode_uint(buf, 3, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Map(entries) => encode_map_canonical(buf, entries),
        Value::Tag(tag, inner) => {
            encode_uint(buf, 6, *tag);
            encode_value_to(buf, inner);
        }
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        _ => buf.push(0xf6),
    }
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: ciborium::value::Integer) {
    let n: i128 = i.into();

    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        let abs = (-1 - n) as u64;
        encode_uint(buf, 1, abs);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffffffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

/// Major type 5, with entries ordered by their encoded key bytes.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) {
    let mut sorted: Vec<(Vec<u8>, &Value)> = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let mut encoded = Vec::new();
        encode_value_to(&mut encoded, key);
        sorted.push((encoded, value));
    }
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, sorted.len() as u64);
    for (key, value) in sorted {
        buf.extend_from_slice(&key);
        encode_value_to(buf, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, NormalizedValue)]) -> BTreeMap<String, NormalizedValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_encoding_deterministic() {
        let f = fields(&[
            ("quantity_on_hand", NormalizedValue::Number("50".into())),
            ("status", NormalizedValue::Text("active".into())),
        ]);
        let a = canonical_material_bytes(RecordKind::Item, 1, &f);
        let b = canonical_material_bytes(RecordKind::Item, 1, &f);
        assert_eq!(a, b);
    }

    #[test]
    fn test_version_and_kind_change_bytes() {
        let f = fields(&[("status", NormalizedValue::Text("active".into()))]);
        let v1 = canonical_material_bytes(RecordKind::Item, 1, &f);
        let v2 = canonical_material_bytes(RecordKind::Item, 2, &f);
        let vendor = canonical_material_bytes(RecordKind::Vendor, 1, &f);
        assert_ne!(v1, v2);
        assert_ne!(v1, vendor);
    }

    #[test]
    fn test_number_distinct_from_text() {
        let as_number = fields(&[("x", NormalizedValue::Number("5".into()))]);
        let as_text = fields(&[("x", NormalizedValue::Text("5".into()))]);
        assert_ne!(
            canonical_material_bytes(RecordKind::Item, 1, &as_number),
            canonical_material_bytes(RecordKind::Item, 1, &as_text)
        );
    }

    #[test]
    fn test_integer_encoding() {
        let mut buf = Vec::new();

        encode_uint(&mut buf, 0, 0);
        assert_eq!(buf, vec![0x00]);

        buf.clear();
        encode_uint(&mut buf, 0, 23);
        assert_eq!(buf, vec![0x17]);

        buf.clear();
        encode_uint(&mut buf, 0, 24);
        assert_eq!(buf, vec![0x18, 24]);

        buf.clear();
        encode_uint(&mut buf, 0, 256);
        assert_eq!(buf, vec![0x19, 0x01, 0x00]);
    }

    #[test]
    fn test_map_key_ordering() {
        let mut buf = Vec::new();
        let entries = vec![
            (Value::Text("b".into()), Value::Bool(true)),
            (Value::Text("a".into()), Value::Null),
        ];
        encode_map_canonical(&mut buf, &entries);

        // Map header (2 entries), then "a" before "b"
        assert_eq!(buf[0], 0xa2);
        assert_eq!(&buf[1..3], &[0x61, b'a']);
        assert_eq!(buf[3], 0xf6);
        assert_eq!(&buf[4..6], &[0x61, b'b']);
        assert_eq!(buf[6], 0xf5);
    }

    #[test]
    fn test_tag_encoding() {
        let mut buf = Vec::new();
        encode_value_to(&mut buf, &Value::Tag(TAG_DECIMAL, Box::new(Value::Text("5".into()))));
        assert_eq!(buf, vec![0xc4, 0x61, b'5']);
    }
}
