//! Remote records and value normalization.
//!
//! A [`RemoteRecord`] is the ephemeral form of a catalog item or vendor as the
//! remote source reported it. All raw fields are kept, including ones the
//! engine does not understand; only the material projection is fingerprinted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{NaturalKey, RecordKind, Timestamp};

/// A single entity read from the remote source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// What kind of entity this is.
    pub kind: RecordKind,
    /// The natural key (SKU or vendor id).
    pub key: NaturalKey,
    /// Raw field set, as reported.
    pub fields: BTreeMap<String, Value>,
    /// Remote-reported last modification time. Unreliable and optional.
    pub remote_modified_at: Option<Timestamp>,
}

impl RemoteRecord {
    /// Create an empty record.
    pub fn new(kind: RecordKind, key: NaturalKey) -> Self {
        Self {
            kind,
            key,
            fields: BTreeMap::new(),
            remote_modified_at: None,
        }
    }

    /// Set a field (builder style).
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Set the remote modification time (builder style).
    pub fn modified_at(mut self, at: Timestamp) -> Self {
        self.remote_modified_at = Some(at);
        self
    }

    /// Get a raw field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Read a field as a number, accepting numeric strings.
    pub fn numeric_field(&self, name: &str) -> Option<f64> {
        match self.fields.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    /// Normalized view of the named fields. Missing fields normalize to `Null`.
    pub fn normalized(&self, names: &[String]) -> BTreeMap<String, NormalizedValue> {
        names
            .iter()
            .map(|name| {
                let value = self
                    .fields
                    .get(name)
                    .map(normalize_value)
                    .unwrap_or(NormalizedValue::Null);
                (name.clone(), value)
            })
            .collect()
    }

    /// Keep only the named fields (used to apply a narrow field scope).
    pub fn retain_fields(&mut self, names: &[String]) {
        self.fields.retain(|k, _| names.iter().any(|n| n == k));
    }
}

/// A field value after normalization.
///
/// Normalization removes representation differences that do not change the
/// meaning of a value: `"5"`, `5`, `5.0` and `"05"` are all `Number("5")`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum NormalizedValue {
    /// Null, missing, or empty string.
    Null,
    /// A boolean, or the strings `"true"`/`"false"` in any case.
    Bool(bool),
    /// A canonical decimal string (no leading/trailing zeros, no exponent).
    Number(String),
    /// A trimmed non-numeric string.
    Text(String),
    /// Arrays and objects, as compact JSON with sorted object keys.
    Opaque(String),
}

/// Normalize a raw JSON value.
pub fn normalize_value(value: &Value) -> NormalizedValue {
    match value {
        Value::Null => NormalizedValue::Null,
        Value::Bool(b) => NormalizedValue::Bool(*b),
        Value::Number(n) => {
            let text = if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                // Display for f64 never uses exponent notation.
                n.as_f64().map(|f| format!("{}", f)).unwrap_or_else(|| n.to_string())
            };
            match canonical_decimal(&text) {
                Some(d) => NormalizedValue::Number(d),
                None => NormalizedValue::Text(text),
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return NormalizedValue::Null;
            }
            if trimmed.eq_ignore_ascii_case("true") {
                return NormalizedValue::Bool(true);
            }
            if trimmed.eq_ignore_ascii_case("false") {
                return NormalizedValue::Bool(false);
            }
            match canonical_decimal(trimmed) {
                Some(d) => NormalizedValue::Number(d),
                None => NormalizedValue::Text(trimmed.to_string()),
            }
        }
        Value::Array(_) | Value::Object(_) => {
            // serde_json's default map is ordered, so this is key-sorted.
            NormalizedValue::Opaque(value.to_string())
        }
    }
}

/// Canonicalize a plain decimal literal.
///
/// Accepts an optional sign, digits, and at most one decimal point. Returns
/// `None` for anything else (including exponents, which are not produced by
/// [`normalize_value`] for JSON numbers).
fn canonical_decimal(s: &str) -> Option<String> {
    let (negative, body) = match s.as_bytes().first()? {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let (int_part, frac_part) = match body.split_once('.') {
        Some((i, f)) => (i, f),
        None => (body, ""),
    };

    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let int_trimmed = int_part.trim_start_matches('0');
    let frac_trimmed = frac_part.trim_end_matches('0');

    let mut out = String::with_capacity(s.len());
    let is_zero = int_trimmed.is_empty() && frac_trimmed.is_empty();
    if negative && !is_zero {
        out.push('-');
    }
    if int_trimmed.is_empty() {
        out.push('0');
    } else {
        out.push_str(int_trimmed);
    }
    if !frac_trimmed.is_empty() {
        out.push('.');
        out.push_str(frac_trimmed);
    }
    Some(out)
}
