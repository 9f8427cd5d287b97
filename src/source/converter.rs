// ABOUTME: BSON to JSON conversion for extracted documents
// ABOUTME: Maps ObjectId, DateTime, Decimal128 and Binary to analytics-friendly JSON

use base64::Engine;
use bson::{Bson, Document};
use chrono::{SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::record::Record;
use crate::watermark::WatermarkValue;

/// Convert a single BSON value to JSON.
///
/// - ObjectId → 24-char hex string
/// - DateTime → RFC 3339 string with millisecond precision (UTC)
/// - Decimal128 → string, so no precision is lost
/// - Binary → `{"_type": "binary", "subtype": n, "data": base64}`
/// - Int32/Int64/Double/Boolean/String/Null → the matching JSON scalar
/// - Non-finite doubles → string
/// - anything else → relaxed extended JSON
pub fn bson_to_json(value: &Bson) -> JsonValue {
    match value {
        Bson::Null | Bson::Undefined => JsonValue::Null,
        Bson::Boolean(b) => JsonValue::Bool(*b),
        Bson::Int32(i) => json!(i),
        Bson::Int64(i) => json!(i),
        Bson::Double(f) => {
            if f.is_finite() {
                serde_json::Number::from_f64(*f)
                    .map(JsonValue::Number)
                    .unwrap_or_else(|| JsonValue::String(f.to_string()))
            } else {
                JsonValue::String(f.to_string())
            }
        }
        Bson::String(s) => JsonValue::String(s.clone()),
        Bson::ObjectId(oid) => JsonValue::String(oid.to_hex()),
        Bson::DateTime(dt) => match Utc.timestamp_millis_opt(dt.timestamp_millis()).single() {
            Some(ts) => JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => json!(dt.timestamp_millis()),
        },
        Bson::Decimal128(_) => {
            let extjson = value.clone().into_relaxed_extjson();
            match extjson.get("$numberDecimal").and_then(|d| d.as_str()) {
                Some(digits) => JsonValue::String(digits.to_string()),
                None => extjson,
            }
        }
        Bson::Binary(binary) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&binary.bytes);
            json!({
                "_type": "binary",
                "subtype": u8::from(binary.subtype),
                "data": encoded
            })
        }
        Bson::Array(items) => JsonValue::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => JsonValue::Object(document_to_record(doc)),
        other => other.clone().into_relaxed_extjson(),
    }
}

/// Convert a BSON document into a record, keeping every field.
pub fn document_to_record(doc: &Document) -> Record {
    doc.iter()
        .map(|(key, value)| (key.clone(), bson_to_json(value)))
        .collect()
}

/// Cursor value to BSON for use in a range filter.
pub fn watermark_to_bson(value: &WatermarkValue) -> Bson {
    match value {
        WatermarkValue::Int(i) => Bson::Int64(*i),
        WatermarkValue::Timestamp(ts) => {
            Bson::DateTime(bson::DateTime::from_millis(ts.timestamp_millis()))
        }
    }
}

/// Cursor value read back from BSON, for range probing.
///
/// Only integers and dates can be partitioned; other types return `None`.
pub fn bson_to_watermark(value: &Bson) -> Option<WatermarkValue> {
    match value {
        Bson::Int32(i) => Some(WatermarkValue::Int(i64::from(*i))),
        Bson::Int64(i) => Some(WatermarkValue::Int(*i)),
        Bson::DateTime(dt) => Utc
            .timestamp_millis_opt(dt.timestamp_millis())
            .single()
            .map(WatermarkValue::Timestamp),
        _ => None,
    }
}
