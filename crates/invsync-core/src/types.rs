//! Strong type definitions for invsync.
//!
//! Identifiers are newtypes to prevent mixing up keys, run ids and raw strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Unix timestamp in milliseconds.
pub type Timestamp = i64;

/// The externally stable identifier of a remote entity (SKU or vendor id).
///
/// Keys are trimmed on construction and never empty.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Create a key, rejecting empty or whitespace-only input.
    pub fn new(key: impl AsRef<str>) -> Result<Self, CoreError> {
        let trimmed = key.as_ref().trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidKey("empty key".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NaturalKey({})", self.0)
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NaturalKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NaturalKey {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for NaturalKey {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NaturalKey> for String {
    fn from(key: NaturalKey) -> Self {
        key.0
    }
}

/// The kind of entity a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A catalog item, including its stock level.
    Item,
    /// A vendor.
    Vendor,
}

impl RecordKind {
    /// All record kinds, in processing order.
    pub const ALL: [RecordKind; 2] = [RecordKind::Item, RecordKind::Vendor];

    /// Stable string form used in storage and URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Item => "item",
            RecordKind::Vendor => "vendor",
        }
    }

    /// Single-byte tag mixed into fingerprints.
    pub(crate) fn tag(&self) -> u8 {
        match self {
            RecordKind::Item => 1,
            RecordKind::Vendor => 2,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "item" => Ok(RecordKind::Item),
            "vendor" => Ok(RecordKind::Vendor),
            other => Err(CoreError::UnknownKind(other.to_string())),
        }
    }
}

/// Identifier of one sync run.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub uuid::Uuid);

impl RunId {
    /// Generate a fresh random run id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    /// Hyphenated string form.
    pub fn to_string_hyphenated(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

impl fmt::Debug for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunId({})", self.0.simple())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for RunId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::InvalidRunId(format!("{}: {}", s, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_key_trims() {
        let key = NaturalKey::new("  A100 ").unwrap();
        assert_eq!(key.as_str(), "A100");
    }

    #[test]
    fn test_natural_key_rejects_empty() {
        assert!(NaturalKey::new("   ").is_err());
        assert!(NaturalKey::new("").is_err());
    }

    #[test]
    fn test_record_kind_roundtrip() {
        for kind in RecordKind::ALL {
            assert_eq!(kind.as_str().parse::<RecordKind>().unwrap(), kind);
        }
        assert!("widget".parse::<RecordKind>().is_err());
    }

    #[test]
    fn test_run_id_parse_display() {
        let id = RunId::from_bytes([0x42; 16]);
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<RunId>().is_err());
    }
}
