//! BLAKE3 hashing of resolved node inputs.
//!
//! The inputs hash is what makes re-applies idempotent: a node whose record
//! entry carries the same hash is not sent to the provider again.

use crate::core::types::{Attributes, ResourceKind};
use serde_json::Value;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Compute a composite hash from multiple components.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// Serialize a value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hash a node's kind together with its fully resolved inputs.
///
/// Input declaration order does not affect the hash.
pub fn hash_inputs(kind: ResourceKind, inputs: &Attributes) -> String {
    let object: serde_json::Map<String, Value> = inputs
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let body = canonical_json(&Value::Object(object));
    composite_hash(&[kind.as_str(), &body])
}
