//! In-process cache index used by tests and the CLI's embedded mode.

use crate::cache::{CacheEntry, CacheIndex};
use crate::error::CoreError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheIndex for MemoryCache {
    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, CoreError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            None => Ok(None),
            Some(entry) if entry.is_expired(Utc::now()) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.clone())),
        }
    }

    async fn put(&self, key: &str, entry: CacheEntry, _ttl: Duration) -> Result<(), CoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), entry);
        Ok(())
    }
}
