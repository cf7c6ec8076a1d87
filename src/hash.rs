//! Content hashing for cache keys and audit entries.
//!
//! All hashes are blake3 hex digests. JSON values are hashed in their
//! canonical serde_json form, where object keys are already sorted.

use serde::Serialize;

pub fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

pub fn hash_json(value: &serde_json::Value) -> String {
    // serde_json's default map is a BTreeMap, so key order is stable.
    hash_text(&value.to_string())
}

/// Hash any serializable value through its JSON form. Fails for values
/// JSON cannot represent, such as maps with non-string keys.
pub fn hash_serialized<T: Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_value(value).map(|v| hash_json(&v))
}

/// Short prefix used in log lines.
pub fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}
