//! Redis-backed cache index: entries as JSON values with a server-side
//! expiry, so lazy removal comes for free.

use crate::cache::{CacheEntry, CacheIndex};
use crate::error::CoreError;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

fn cache_key(key: &str) -> String {
    format!("mixdown:cache:{}", key)
}

#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let client = redis::Client::open(url).map_err(|e| CoreError::Cache(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CoreError::Cache(e.to_string()))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheIndex for RedisCache {
    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, CoreError> {
        let mut con = self.manager.clone();
        let raw: Option<String> = con
            .get(cache_key(key))
            .await
            .map_err(|e| CoreError::Cache(e.to_string()))?;
        match raw {
            None => Ok(None),
            Some(text) => {
                let entry: CacheEntry = serde_json::from_str(&text)?;
                // Redis expiry normally beats us to it; the document TTL is
                // still checked in case of clock drift.
                if entry.is_expired(Utc::now()) {
                    let _ = con.del::<_, ()>(cache_key(key)).await;
                    return Ok(None);
                }
                Ok(Some(entry))
            }
        }
    }

    async fn put(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), CoreError> {
        let payload = serde_json::to_string(&entry)?;
        let mut con = self.manager.clone();
        con.pset_ex::<_, _, ()>(cache_key(key), payload, ttl.as_millis() as u64)
            .await
            .map_err(|e| CoreError::Cache(e.to_string()))?;
        Ok(())
    }
}
