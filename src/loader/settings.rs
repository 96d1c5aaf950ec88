//! Dot-path flattening of nested settings objects.

use serde_json::{Map, Value};

/// Flatten nested objects into `("a.b.c", value)` pairs.
///
/// Strings are stored as-is, other scalars with their JSON text (`null` becomes
/// `"null"`), and arrays as one JSON-encoded value rather than indexed paths.
/// Empty nested objects produce no entries. Output follows key order of `settings`.
pub fn flatten_settings(settings: &Map<String, Value>) -> Vec<(String, String)> {
    let mut flattened = Vec::new();
    flatten_into(settings, "", &mut flattened);
    flattened
}

fn flatten_into(object: &Map<String, Value>, prefix: &str, out: &mut Vec<(String, String)>) {
    for (key, value) in object {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        match value {
            Value::Object(nested) => flatten_into(nested, &path, out),
            Value::String(text) => out.push((path, text.clone())),
            other => out.push((path, other.to_string())),
        }
    }
}

/// Deep-merge `overrides` on top of `defaults`. Nested objects merge key by key;
/// any other value in `overrides` replaces the default outright.
pub fn merge_settings(defaults: &Map<String, Value>, overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        match (merged.get_mut(key), value) {
            (Some(Value::Object(base)), Value::Object(nested)) => {
                *base = merge_settings(base, nested);
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}
