//! Redis-backed queue bus: RPUSH/BLPOP lists and INCRBY/DECR counters.
//!
//! Queue names are used verbatim (`<service>_queue`, `job_status_events`)
//! so external workers can subscribe without knowing orchestrator
//! internals. Transient command failures are retried with bounded
//! exponential backoff before surfacing as [`CoreError::Queue`].

use crate::bus::QueueBus;
use crate::error::CoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

const BACKOFF_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct RedisBus {
    manager: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let client = redis::Client::open(url).map_err(|e| CoreError::Queue(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CoreError::Queue(e.to_string()))?;
        Ok(Self { manager })
    }

    async fn with_backoff<T, F, Fut>(&self, what: &str, op: F) -> Result<T, CoreError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let mut delay = BACKOFF_BASE;
        let mut last_err = None;
        for attempt in 0..BACKOFF_ATTEMPTS {
            match op(self.manager.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(%what, attempt, error = %e, "redis command failed");
                    last_err = Some(e);
                    if attempt + 1 < BACKOFF_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(CoreError::Queue(format!(
            "{} failed after {} attempts: {}",
            what,
            BACKOFF_ATTEMPTS,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[async_trait]
impl QueueBus for RedisBus {
    async fn declare(&self, _queue: &str) -> Result<(), CoreError> {
        // Redis lists exist implicitly on first push.
        Ok(())
    }

    async fn push(&self, queue: &str, payload: &str) -> Result<(), CoreError> {
        let queue = queue.to_string();
        let payload = payload.to_string();
        self.with_backoff("push", move |mut con| {
            let queue = queue.clone();
            let payload = payload.clone();
            async move { con.rpush::<_, _, ()>(queue, payload).await }
        })
        .await
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, CoreError> {
        // BLPOP handles the blocking wait; a timeout is a normal outcome,
        // not an error, so no backoff wrapper here.
        let mut con = self.manager.clone();
        let reply: Option<(String, String)> = con
            .blpop(queue, timeout.as_secs_f64().max(0.01))
            .await
            .map_err(|e| CoreError::Queue(e.to_string()))?;
        Ok(reply.map(|(_, payload)| payload))
    }

    async fn incr_counter(&self, key: &str, delta: i64) -> Result<i64, CoreError> {
        let key = key.to_string();
        self.with_backoff("incr_counter", move |mut con| {
            let key = key.clone();
            async move { con.incr::<_, _, i64>(key, delta).await }
        })
        .await
    }

    async fn decr_counter(&self, key: &str) -> Result<i64, CoreError> {
        let key = key.to_string();
        self.with_backoff("decr_counter", move |mut con| {
            let key = key.clone();
            async move { con.decr::<_, _, i64>(key, 1).await }
        })
        .await
    }

    async fn clear_counter(&self, key: &str) -> Result<(), CoreError> {
        let key = key.to_string();
        self.with_backoff("clear_counter", move |mut con| {
            let key = key.clone();
            async move { con.del::<_, ()>(key).await }
        })
        .await
    }
}
