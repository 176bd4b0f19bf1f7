//! Per-field string codec for opaque `spec` / `status` payloads.
//!
//! The resource API stores every top-level `spec` and `status` value as a string.
//! Writes JSON-encode each field independently; reads try to JSON-decode each field
//! and keep the raw string when that fails. Legacy string-valued fields depend on
//! the permissive read, so decoding never errors.

use serde_json::{Map, Value};

/// Encode a `spec` field: always JSON-encoded, including plain strings.
pub fn encode_spec_field(v: &Value) -> Value {
    Value::String(v.to_string())
}

/// Encode a `status` field: structured values and scalars are JSON-encoded,
/// plain strings are stored as-is so `state`-like fields stay human readable.
pub fn encode_status_field(v: &Value) -> Value {
    match v {
        Value::String(_) => v.clone(),
        other => Value::String(other.to_string()),
    }
}

/// Decode one stored field.
///
/// Two branches only: a string that parses as JSON yields the parsed value,
/// any other string is returned unchanged. Non-string values pass through.
pub fn decode_field(v: &Value) -> Value {
    match v {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed) => parsed,
            Err(_) => v.clone(),
        },
        other => other.clone(),
    }
}

pub fn encode_spec(spec: &Map<String, Value>) -> Map<String, Value> {
    spec.iter().map(|(k, v)| (k.clone(), encode_spec_field(v))).collect()
}

pub fn encode_status(status: &Map<String, Value>) -> Map<String, Value> {
    status.iter().map(|(k, v)| (k.clone(), encode_status_field(v))).collect()
}

pub fn decode_map(stored: &Map<String, Value>) -> Map<String, Value> {
    stored.iter().map(|(k, v)| (k.clone(), decode_field(v))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_values_round_trip() {
        for v in [json!({"plan_id": "p1", "context": {"org": "o"}}), json!([1, 2, 3]), json!(42), json!(true), json!(null)] {
            assert_eq!(decode_field(&encode_spec_field(&v)), v);
            assert_eq!(decode_field(&encode_status_field(&v)), v);
        }
    }

    #[test]
    fn spec_strings_round_trip_even_when_json_like() {
        let v = json!("{not json");
        assert_eq!(decode_field(&encode_spec_field(&v)), v);
        let looks_numeric = json!("123");
        assert_eq!(decode_field(&encode_spec_field(&looks_numeric)), looks_numeric);
    }

    #[test]
    fn invalid_json_string_is_kept_raw() {
        let stored = json!("in_progress");
        assert_eq!(decode_field(&stored), json!("in_progress"));
        assert_eq!(encode_status_field(&json!("in_progress")), json!("in_progress"));
    }

    #[test]
    fn fields_are_encoded_independently() {
        let mut status = Map::new();
        status.insert("state".into(), json!("in_queue"));
        status.insert("response".into(), json!({"task_id": "t"}));
        let enc = encode_status(&status);
        assert_eq!(enc["state"], json!("in_queue"));
        assert_eq!(enc["response"], json!("{\"task_id\":\"t\"}"));
        assert_eq!(decode_map(&enc), status);
    }
}
