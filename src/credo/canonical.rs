//! Canonical payload serialization
//!
//! A Credo token's identity is the digest of its canonical form: objects
//! are emitted with recursively sorted keys and compact JSON encoding, so
//! two independently constructed payloads with the same semantic content
//! hash to the same id.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value into its canonical string form
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Content id: lowercase hex sha256 of the canonical form
pub fn content_id(value: &Value) -> String {
    hex::encode(content_digest(value))
}

/// Raw digest of the canonical form, signed by token issuers
pub fn content_digest(value: &Value) -> [u8; 32] {
    let canonical = canonical_string(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.finalize().into()
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
                // Reuse serde_json's string escaping for the key
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
        // Scalars already have a single compact encoding
        other => out.push_str(&other.to_string()),
    }
}
