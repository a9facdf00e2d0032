use std::cmp::Ordering;

use serde_json::{Map, Value};

/// A single stored entity, field name to JSON value.
pub type Record = Map<String, Value>;

/// Primary-key values in the order of `Model::primary_keys`.
pub type KeyTuple = Vec<Value>;

/// Canonical text form of a value, used wherever two values must compare
/// equal independent of how the backend produced them (`1` and `1.0` are the
/// same key, `"1"` is not).
pub fn canonical(value: &Value) -> String {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return i.to_string();
            }
            if let Some(u) = n.as_u64() {
                return u.to_string();
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
                Some(f) => f.to_string(),
                None => n.to_string(),
            }
        }
        other => other.to_string(),
    }
}

pub fn canonical_tuple(values: &[Value]) -> String {
    let parts: Vec<String> = values.iter().map(canonical).collect();
    format!("[{}]", parts.join(","))
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    canonical(a) == canonical(b)
}

/// Null and absent are the same thing for every policy and operator.
pub fn is_null(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

/// Extract the key tuple for `fields`; `None` when any part is null or absent.
pub fn key_of(record: &Record, fields: &[String]) -> Option<KeyTuple> {
    let mut key = Vec::with_capacity(fields.len());
    for field in fields {
        match record.get(field) {
            Some(v) if !v.is_null() => key.push(v.clone()),
            _ => return None,
        }
    }
    Some(key)
}

/// Ordering between two values of the same JSON kind. Mixed kinds and nulls
/// are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return Some(x.cmp(&y));
            }
            x.as_f64()?.partial_cmp(&y.as_f64()?)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn kind_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

/// Total order used for sorting: nulls first, then by kind, then by value.
pub fn sort_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (kind_rank(a), kind_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or_else(|| canonical(x).cmp(&canonical(y))),
        _ => Ordering::Equal,
    }
}

/// Shallow merge of `patch` into `record`; explicit nulls are kept as nulls.
pub fn merge(record: &mut Record, patch: &Record) {
    for (k, v) in patch {
        record.insert(k.clone(), v.clone());
    }
}

/// Storage key for the unified JSON tables: blake3 over model name and the
/// canonical key tuple.
pub fn derive_storage_key(table: &str, key: &[Value]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(table.as_bytes());
    hasher.update(b"::");
    hasher.update(canonical_tuple(key).as_bytes());
    hasher.finalize().to_hex().to_string()
}
