//! Structural deltas between revision bodies.
//!
//! A delta is a dict describing the difference between two dict bodies:
//! `{"key": [newValue]}` replaces (or adds), `{"key": []}` removes, and a
//! bare nested dict recurses. Arrays are treated as atomic values. The
//! format is its own inverse operation, not a text diff, so it survives
//! re-encoding.

use serde_json::{Map, Value, json};

use skiffdb_core::error::{Error, Result};

/// Computes the delta that turns `old` into `new`. `None` when the two
/// aren't both dicts (whole-body replacement is cheaper) or are equal.
pub fn create_delta(old: &Value, new: &Value) -> Option<Value> {
    let (Value::Object(old_map), Value::Object(new_map)) = (old, new) else {
        return None;
    };
    let diff = diff_maps(old_map, new_map);
    if diff.is_empty() {
        Some(Value::Object(Map::new()))
    } else {
        Some(Value::Object(diff))
    }
}

fn diff_maps(old: &Map<String, Value>, new: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, new_value) in new {
        match old.get(key) {
            None => {
                out.insert(key.clone(), json!([new_value]));
            }
            Some(old_value) if old_value == new_value => {}
            Some(Value::Object(old_nested)) => {
                if let Value::Object(new_nested) = new_value {
                    let nested = diff_maps(old_nested, new_nested);
                    if !nested.is_empty() {
                        out.insert(key.clone(), Value::Object(nested));
                    }
                } else {
                    out.insert(key.clone(), json!([new_value]));
                }
            }
            Some(_) => {
                out.insert(key.clone(), json!([new_value]));
            }
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            out.insert(key.clone(), json!([]));
        }
    }
    out
}

/// Applies a delta produced by [`create_delta`] to `base`.
pub fn apply_delta(base: &Value, delta: &Value) -> Result<Value> {
    let Value::Object(delta_map) = delta else {
        return Err(Error::BadDelta("delta must be a dict".into()));
    };
    let Value::Object(base_map) = base else {
        return Err(Error::BadDelta("delta base must be a dict".into()));
    };
    let mut out = base_map.clone();
    apply_to_map(&mut out, delta_map)?;
    Ok(Value::Object(out))
}

fn apply_to_map(base: &mut Map<String, Value>, delta: &Map<String, Value>) -> Result<()> {
    for (key, op) in delta {
        match op {
            Value::Array(items) => match items.len() {
                0 => {
                    base.remove(key);
                }
                1 => {
                    base.insert(key.clone(), items[0].clone());
                }
                _ => {
                    return Err(Error::BadDelta(format!("bad operation for '{key}'")));
                }
            },
            Value::Object(nested) => match base.get_mut(key) {
                Some(Value::Object(target)) => apply_to_map(target, nested)?,
                _ => {
                    return Err(Error::BadDelta(format!(
                        "nested delta for non-dict '{key}'"
                    )));
                }
            },
            _ => {
                return Err(Error::BadDelta(format!("bad operation for '{key}'")));
            }
        }
    }
    Ok(())
}

/// Encodes a delta only when it's strictly smaller than the full body.
pub fn delta_if_smaller(old: &Value, new: &Value) -> Option<(Value, Vec<u8>)> {
    let delta = create_delta(old, new)?;
    let delta_bytes = serde_json::to_vec(&delta).ok()?;
    let full_bytes = serde_json::to_vec(new).ok()?;
    (delta_bytes.len() < full_bytes.len()).then_some((delta, delta_bytes))
}
