//! Deterministic cache keys.
//!
//! The key is a sha256 digest over a canonical JSON rendering of
//! (service, program, sorted parameter pairs, sorted input content
//! checksums). Any edit to a parameter or to an upstream artifact changes
//! the key, which is what invalidates stale hits.

use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Key for one step execution. `input_checksums` maps each input
/// placeholder to the content checksum of the value bound to it.
pub fn cache_key(
    service: &str,
    program: &str,
    flags: &BTreeMap<String, serde_json::Value>,
    input_checksums: &BTreeMap<String, String>,
) -> String {
    // BTreeMap serialisation is key-sorted, so this rendering is canonical.
    let canonical = json!({
        "service": service,
        "program": program,
        "flags": flags,
        "inputs": input_checksums,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Checksum stand-in for a literal input value: literals have no producer
/// to report a content checksum, so their canonical JSON is hashed
/// directly.
pub fn literal_checksum(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"literal:");
    hasher.update(value.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Checksum for one element of a collection-valued producer output. The
/// producer reports a single checksum for the indexed set; each fanned
/// instance folds its index in so sibling instances get distinct keys.
pub fn element_checksum(collection_checksum: &str, index: usize) -> String {
    format!("{}#{}", collection_checksum, index)
}
