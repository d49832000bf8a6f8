//! Document value model: collections, ids, timestamps and field values.
//!
//! The engine treats documents opaquely except for the two system
//! timestamp fields (`created_at`, `updated_at`), which drive the
//! last-write-wins staleness check in the reconciler. Field values are a
//! tagged union rather than a per-collection schema, so any remote store
//! payload can be represented without code changes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

/// Maximum collection name length in bytes (mirrors Firestore's limit).
const MAX_COLLECTION_NAME_BYTES: usize = 1500;

/// Validated name of a logical document set (e.g. "projects").
///
/// Immutable once a subscription exists for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionName(String);

impl CollectionName {
    /// Validate and wrap a collection name.
    ///
    /// Rejects empty names, names containing `/`, the reserved `.` / `..`
    /// forms, and names longer than the store's 1500-byte limit.
    pub fn new(name: impl Into<String>) -> Result<Self, SyncError> {
        let name = name.into();
        if name.is_empty() {
            return Err(SyncError::InvalidCollection {
                name,
                reason: "name is empty".to_string(),
            });
        }
        if name.len() > MAX_COLLECTION_NAME_BYTES {
            // Truncate for the error message on a char boundary; a raw
            // byte slice would panic inside a multibyte character.
            let preview: String = name.chars().take(32).collect();
            return Err(SyncError::InvalidCollection {
                name: format!("{preview}…"),
                reason: format!("name exceeds {MAX_COLLECTION_NAME_BYTES} bytes"),
            });
        }
        if name.contains('/') {
            return Err(SyncError::InvalidCollection {
                name,
                reason: "name must not contain '/'".to_string(),
            });
        }
        if name == "." || name == ".." {
            return Err(SyncError::InvalidCollection {
                name,
                reason: "name is reserved".to_string(),
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque document identifier, unique within a collection.
///
/// Assigned client-side on create (UUID v4, the way vendor SDKs do) or
/// supplied by the caller for idempotent upserts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Self(millis)
    }

    pub fn millis(self) -> i64 {
        self.0
    }
}

/// Dynamically-typed field value.
///
/// Nested maps use `BTreeMap` so equality and serialized form are stable
/// regardless of insertion order. Numbers compare by bit pattern, not IEEE
/// equality: a document carrying NaN must still equal its own redelivery,
/// or duplicate-discard in the reconciler could never fold it away.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
    Timestamp(Timestamp),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Partial document: the field map supplied to an update call.
pub type Fields = BTreeMap<String, Value>;

/// One record within a collection.
///
/// Carries the two system timestamps; `updated_at` is monotonic
/// non-decreasing per document id and is what last-write-wins compares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub fields: Fields,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Document {
    /// Create a document with both system timestamps set to `now`.
    pub fn new(fields: Fields) -> Self {
        let now = Timestamp::now();
        Self {
            fields,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create with explicit timestamps (resync payloads, tests).
    pub fn with_timestamps(fields: Fields, created_at: Timestamp, updated_at: Timestamp) -> Self {
        Self {
            fields,
            created_at,
            updated_at,
        }
    }

    /// Check the system fields before a write reaches the remote store.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.created_at.millis() < 0 || self.updated_at.millis() < 0 {
            return Err(SyncError::InvalidDocument(
                "system timestamps must not be negative".to_string(),
            ));
        }
        if self.updated_at < self.created_at {
            return Err(SyncError::InvalidDocument(format!(
                "updated_at {} precedes created_at {}",
                self.updated_at.millis(),
                self.created_at.millis()
            )));
        }
        Ok(())
    }

    /// Merge a partial field map into this document and bump `updated_at`.
    ///
    /// Fields present in `partial` overwrite existing ones; other fields
    /// are kept. `created_at` never changes.
    pub fn merge(&mut self, partial: Fields) {
        for (key, value) in partial {
            self.fields.insert(key, value);
        }
        let now = Timestamp::now();
        // Wall clocks can step backwards; updated_at never does.
        if now > self.updated_at {
            self.updated_at = now;
        } else {
            self.updated_at = Timestamp(self.updated_at.millis() + 1);
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_name_valid() {
        let name = CollectionName::new("projects").unwrap();
        assert_eq!(name.as_str(), "projects");
        assert_eq!(name.to_string(), "projects");
    }

    #[test]
    fn test_collection_name_empty_rejected() {
        let err = CollectionName::new("").unwrap_err();
        assert!(matches!(err, SyncError::InvalidCollection { .. }));
    }

    #[test]
    fn test_collection_name_slash_rejected() {
        assert!(CollectionName::new("projects/archive").is_err());
    }

    #[test]
    fn test_collection_name_reserved_rejected() {
        assert!(CollectionName::new(".").is_err());
        assert!(CollectionName::new("..").is_err());
    }

    #[test]
    fn test_collection_name_too_long_rejected() {
        let long = "a".repeat(1501);
        assert!(CollectionName::new(long).is_err());
        let max = "a".repeat(1500);
        assert!(CollectionName::new(max).is_ok());
    }

    #[test]
    fn test_collection_name_too_long_multibyte_rejected() {
        // 3 bytes per char; byte 32 falls inside a character, which must
        // not panic while building the error.
        let long = "€".repeat(550);
        let err = CollectionName::new(long).unwrap_err();
        assert!(matches!(err, SyncError::InvalidCollection { .. }));
    }

    #[test]
    fn test_document_id_generate_unique() {
        assert_ne!(DocumentId::generate(), DocumentId::generate());
    }

    #[test]
    fn test_document_validate_ok() {
        let doc = Document::new(Fields::new());
        doc.validate().unwrap();
    }

    #[test]
    fn test_document_validate_reversed_timestamps() {
        let doc = Document::with_timestamps(Fields::new(), Timestamp(100), Timestamp(50));
        assert!(matches!(
            doc.validate().unwrap_err(),
            SyncError::InvalidDocument(_)
        ));
    }

    #[test]
    fn test_document_validate_negative_timestamp() {
        let doc = Document::with_timestamps(Fields::new(), Timestamp(-1), Timestamp(0));
        assert!(doc.validate().is_err());
    }

    #[test]
    fn test_merge_overwrites_and_bumps_updated_at() {
        let mut fields = Fields::new();
        fields.insert("status".to_string(), Value::from("open"));
        fields.insert("owner".to_string(), Value::from("amira"));
        let mut doc = Document::new(fields);
        let before = doc.updated_at;

        let mut partial = Fields::new();
        partial.insert("status".to_string(), Value::from("closed"));
        doc.merge(partial);

        assert_eq!(doc.get("status"), Some(&Value::from("closed")));
        assert_eq!(doc.get("owner"), Some(&Value::from("amira")));
        assert!(doc.updated_at > before);
    }

    #[test]
    fn test_merge_is_monotonic_even_with_stuck_clock() {
        let mut doc = Document::new(Fields::new());
        // Force updated_at into the future relative to the wall clock.
        doc.updated_at = Timestamp(doc.updated_at.millis() + 3_600_000);
        let before = doc.updated_at;
        doc.merge(Fields::new());
        assert!(doc.updated_at > before);
    }

    #[test]
    fn test_nan_value_equals_its_redelivery() {
        let nan = Value::Num(f64::NAN);
        assert_eq!(nan, nan.clone());
        assert_ne!(Value::Num(1.0), Value::Num(2.0));
        assert_eq!(Value::Num(1.5), Value::Num(1.5));

        let mut fields = Fields::new();
        fields.insert("ratio".to_string(), Value::Num(f64::NAN));
        let doc = Document::with_timestamps(fields, Timestamp(0), Timestamp(10));
        assert_eq!(doc, doc.clone());
    }

    #[test]
    fn test_value_serde_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert("nested".to_string(), Value::List(vec![Value::Num(1.0)]));
        let value = Value::Map(map);
        let json = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
