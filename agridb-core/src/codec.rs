/// Record codec
///
/// Stable binary form for records and commit-log payloads (bincode behind a
/// one byte format tag), a JSON rendering for display sinks, and the text
/// form of timestamps.

use crate::{Error, Key, Record, Result, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

/// Format tag written in front of every encoded payload
pub const CODEC_VERSION: u8 = 1;

/// Encode any serializable payload with the format tag
pub fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(payload)
        .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
    let mut buf = Vec::with_capacity(body.len() + 1);
    buf.push(CODEC_VERSION);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode a payload produced by [`encode`]
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    match data.split_first() {
        Some((&CODEC_VERSION, body)) => bincode::deserialize(body)
            .map_err(|e| Error::Corruption(format!("Deserialize error: {}", e))),
        Some((tag, _)) => Err(Error::Corruption(format!(
            "Unknown codec version {}",
            tag
        ))),
        None => Err(Error::Corruption("Empty payload".to_string())),
    }
}

pub fn encode_record(record: &Record) -> Result<Vec<u8>> {
    encode(record)
}

pub fn decode_record(data: &[u8]) -> Result<Record> {
    decode(data)
}

/// Render a timestamp the way `Date.toISOString()` does:
/// `2024-09-05T10:30:00.000Z`
pub fn format_timestamp(millis: i64) -> Result<String> {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Error::InvalidArgument(format!("Timestamp out of range: {}", millis)))?;
    Ok(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Parse a timestamp from text.
///
/// Accepts RFC 3339 (`2024-09-05T10:30:00.000Z`, offsets allowed) and the
/// zone-less forms an HTML datetime field produces (`2024-09-05T10:30`,
/// with optional seconds and fraction) or a bare date. Zone-less input is
/// read as UTC.
pub fn parse_timestamp(text: &str) -> Result<i64> {
    let text = text.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_millis());
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }

    Err(Error::InvalidArgument(format!("Unrecognized timestamp: {:?}", text)))
}

/// JSON form of one value; timestamps become ISO strings
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Number(n) => json!(n),
        Value::Sequence(v) => json!(v),
        Value::Text(s) => json!(s),
        Value::Timestamp(ms) => match format_timestamp(*ms) {
            Ok(text) => json!(text),
            Err(_) => json!(ms),
        },
    }
}

/// JSON object for a stored record, with its key under `id`.
///
/// A record with its own `id` attribute keeps it; the key then goes under
/// the first free name of `_id`, `__id` and so on.
pub fn record_to_json(key: Key, record: &Record) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for (name, value) in record {
        object.insert(name.clone(), value_to_json(value));
    }
    let mut key_field = "id".to_string();
    while object.contains_key(&key_field) {
        key_field.insert(0, '_');
    }
    object.insert(key_field, json!(key));
    serde_json::Value::Object(object)
}

/// Pretty-printed JSON array of stored records
pub fn render_json_pretty(records: &[(Key, Record)]) -> Result<String> {
    let array: Vec<serde_json::Value> = records
        .iter()
        .map(|(key, record)| record_to_json(*key, record))
        .collect();
    serde_json::to_string_pretty(&array)
        .map_err(|e| Error::Internal(format!("JSON render error: {}", e)))
}
