//! Flattening of nested JSON payloads into frame columns
//!
//! `{"imu": {"ax": 0.1}, "temps": [20, 21]}` under prefix `front_imu_`
//! becomes `front_imu_imu_ax`, `front_imu_temps_0` and `front_imu_temps_1`.
//! Scalars keep their JSON type. Object keys keep packet order.

use std::fmt::Write;

use serde_json::{Map, Value};

use crate::store::Sample;

/// Joins path segments in flattened keys
pub const SEPARATOR: char = '_';

/// Ordered flat column mapping
pub type FlatFields = Map<String, Value>;

/// Flatten `value` into `out`
///
/// `prefix` carries a trailing separator (`"front_imu_"`); it is stripped
/// from the final key of every scalar leaf. Empty objects and arrays
/// contribute nothing.
pub fn flatten(prefix: &str, value: &Value, out: &mut FlatFields) {
    let mut path = String::with_capacity(prefix.len() + 32);
    path.push_str(prefix);
    walk(&mut path, value, out);
}

fn walk(path: &mut String, value: &Value, out: &mut FlatFields) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let len = path.len();
                path.push_str(key);
                path.push(SEPARATOR);
                walk(path, child, out);
                path.truncate(len);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                let len = path.len();
                let _ = write!(path, "{}{}", index, SEPARATOR);
                walk(path, child, out);
                path.truncate(len);
            }
        }
        scalar => {
            let path = path.as_str();
            let key = path.strip_suffix(SEPARATOR).unwrap_or(path);
            out.insert(key.to_string(), scalar.clone());
        }
    }
}

/// Flatten one channel's sample into frame columns
///
/// Writes `<channel>_log_ts` with the arrival time, then the payload under
/// `<channel>_`. A top-level `identity_field` (the sender naming itself)
/// is skipped since the channel prefix already identifies it.
pub fn flatten_sample(
    channel: &str,
    sample: &Sample,
    identity_field: Option<&str>,
    out: &mut FlatFields,
) {
    out.insert(format!("{}{}log_ts", channel, SEPARATOR), Value::from(sample.arrival_time));

    let mut path = String::with_capacity(channel.len() + 32);
    path.push_str(channel);
    path.push(SEPARATOR);

    match &sample.payload {
        Value::Object(map) => {
            for (key, child) in map {
                if identity_field == Some(key.as_str()) {
                    continue;
                }
                let len = path.len();
                path.push_str(key);
                path.push(SEPARATOR);
                walk(&mut path, child, out);
                path.truncate(len);
            }
        }
        other => walk(&mut path, other, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flat(prefix: &str, value: Value) -> FlatFields {
        let mut out = FlatFields::new();
        flatten(prefix, &value, &mut out);
        out
    }

    #[test]
    fn test_flatten_nested_object() {
        let out = flat("brakes_imu_", json!({"imu": {"ax": 1, "ay": 2}, "ok": true}));

        let keys: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["brakes_imu_imu_ax", "brakes_imu_imu_ay", "brakes_imu_ok"]);
        assert_eq!(out["brakes_imu_imu_ax"], json!(1));
        assert_eq!(out["brakes_imu_ok"], json!(true));
    }

    #[test]
    fn test_flatten_arrays_use_indices() {
        let out = flat("gps_", json!({"fix": [[1.5, 2.5], "x"]}));

        assert_eq!(out["gps_fix_0_0"], json!(1.5));
        assert_eq!(out["gps_fix_0_1"], json!(2.5));
        assert_eq!(out["gps_fix_1"], json!("x"));
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_flatten_preserves_scalar_types() {
        let out = flat("s_", json!({"n": null, "b": false, "i": -3, "f": 0.25, "t": "on"}));

        assert!(out["s_n"].is_null());
        assert!(out["s_b"].is_boolean());
        assert!(out["s_i"].is_i64());
        assert!(out["s_f"].is_f64());
        assert!(out["s_t"].is_string());
    }

    #[test]
    fn test_flatten_empty_containers_contribute_nothing() {
        assert!(flat("s_", json!({"a": {}, "b": []})).is_empty());
    }

    #[test]
    fn test_flatten_is_deterministic() {
        let value = json!({"z": {"b": [1, {"c": 2}]}, "a": 3});

        let first = flat("ch_", value.clone());
        let second = flat("ch_", value);

        assert_eq!(first, second);
        assert_eq!(
            first.keys().collect::<Vec<_>>(),
            second.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_flatten_sample_adds_log_ts_and_drops_identity() {
        let sample = Sample::new(json!({"ts": 1.0, "node": "front_imu", "imu": {"ax": 0.1}}), 42.5);
        let mut out = FlatFields::new();

        flatten_sample("front_imu", &sample, Some("node"), &mut out);

        assert_eq!(out["front_imu_log_ts"], json!(42.5));
        assert_eq!(out["front_imu_ts"], json!(1.0));
        assert_eq!(out["front_imu_imu_ax"], json!(0.1));
        assert!(!out.contains_key("front_imu_node"));
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_flatten_sample_keeps_identity_when_disabled() {
        let sample = Sample::new(json!({"node": "x"}), 1.0);
        let mut out = FlatFields::new();

        flatten_sample("ch", &sample, None, &mut out);

        assert_eq!(out["ch_node"], json!("x"));
    }

    #[test]
    fn test_flatten_sample_nested_identity_is_kept() {
        let sample = Sample::new(json!({"meta": {"node": "x"}}), 1.0);
        let mut out = FlatFields::new();

        flatten_sample("ch", &sample, Some("node"), &mut out);

        assert_eq!(out["ch_meta_node"], json!("x"));
    }
}
