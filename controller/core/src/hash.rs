use serde::Serialize;
use sha2::{Digest, Sha256};

/// Computes a content hash that is stable across processes.
///
/// Values are hashed through their JSON encoding, so callers must sort any
/// set-typed fields (and use ordered maps) before hashing.
///
/// # Panics
///
/// If `value` cannot be encoded as JSON, e.g. a map with non-string keys.
/// Every hashed type in this workspace is a plain data type whose map keys
/// serialize as strings.
pub fn stable_hash<T: Serialize + ?Sized>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).expect("hashed values must encode as JSON");
    format!("{:x}", Sha256::digest(&bytes))
}
