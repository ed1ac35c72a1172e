//! Deterministic-result cache: cache-key -> prior output bindings.
//!
//! Entries outlive the jobs that created them. Liveness of the referenced
//! artifacts is assumed for the TTL; the engine never re-verifies them.

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

use crate::error::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub output_checksums: BTreeMap<String, String>,
    pub produced_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.produced_at);
        age.num_seconds() < 0 || age.num_seconds() as u64 > self.ttl_secs
    }
}

#[async_trait]
pub trait CacheIndex: Send + Sync {
    /// `None` for a miss or an expired entry; expired entries are lazily
    /// removed.
    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, CoreError>;

    async fn put(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), CoreError>;
}
