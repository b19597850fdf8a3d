//! Content fingerprint of a canonical spec.
//!
//! The fingerprint is the SHA-256 of the tree serialized with object keys
//! in sorted order, so the same API loaded from JSON or YAML, or with keys
//! written in a different order, hashes identically. It namespaces the view
//! cache directory and both vector collections.

use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Number of hex characters used when a fingerprint is embedded in names.
pub const SHORT_LEN: usize = 12;

/// Hex-encoded SHA-256 of a canonical spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpecFingerprint(String);

impl SpecFingerprint {
    /// Fingerprint a canonical spec tree.
    pub fn of(canonical: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(canonical).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First [`SHORT_LEN`] hex characters.
    pub fn short(&self) -> &str {
        &self.0[..SHORT_LEN.min(self.0.len())]
    }
}

impl fmt::Display for SpecFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize a JSON value with object keys sorted at every level.
///
/// Independent of whether `serde_json` was built with `preserve_order`.
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

/// SHA-256 hex digest of arbitrary text.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": [1, 2], "x": "s"}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": "s", "y": [1, 2]}, "b": 1}"#).unwrap();
        assert_eq!(SpecFingerprint::of(&a), SpecFingerprint::of(&b));
    }

    #[test]
    fn test_semantic_change_changes_fingerprint() {
        let a = json!({"paths": {"/pets": {"get": {"summary": "List pets"}}}});
        let b = json!({"paths": {"/pets": {"get": {"summary": "List all pets"}}}});
        assert_ne!(SpecFingerprint::of(&a), SpecFingerprint::of(&b));
    }

    #[test]
    fn test_array_order_matters() {
        let a = json!({"tags": ["a", "b"]});
        let b = json!({"tags": ["b", "a"]});
        assert_ne!(SpecFingerprint::of(&a), SpecFingerprint::of(&b));
    }

    #[test]
    fn test_canonical_json_sorted() {
        let v = json!({"z": 1, "a": {"d": null, "c": true}});
        assert_eq!(canonical_json(&v), r#"{"a":{"c":true,"d":null},"z":1}"#);
    }

    #[test]
    fn test_fixed_length() {
        let fp = SpecFingerprint::of(&json!({}));
        assert_eq!(fp.as_str().len(), 64);
        assert_eq!(fp.short().len(), SHORT_LEN);
    }
}
