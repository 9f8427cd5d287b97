// ABOUTME: Schema-less record representation shared by every pipeline stage
// ABOUTME: Provides content hashing and key rendering used for de-duplication

use serde_json::Value;
use sha2::{Digest, Sha256};

/// One source document after normalization.
///
/// Values are a tagged union over scalars, arrays and nested maps
/// (`serde_json::Value`), so no schema is imposed on the source.
pub type Record = serde_json::Map<String, Value>;

/// Stable content hash of a record (hex-encoded SHA-256 of its JSON form).
///
/// Used to drop duplicate records within a run and to recognise records that
/// were already delivered at the watermark boundary.
pub fn record_hash(record: &Record) -> String {
    let canonical = canonicalize(&Value::Object(record.clone()));
    let mut hasher = Sha256::new();
    // Serializing a Value cannot fail
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

/// Rebuild a value with every object's keys in sorted order.
///
/// serde_json may be compiled with `preserve_order` through other crates, in
/// which case maps keep insertion order and the serialized form would depend
/// on how the record was assembled.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Render a primary-key value as the text stored in the destination key column.
///
/// Strings are used verbatim; every other JSON value uses its compact JSON
/// form. Null keys are treated as missing.
pub fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
