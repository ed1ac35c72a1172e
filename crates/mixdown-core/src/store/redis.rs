//! Redis-backed job store.
//!
//! Documents live as JSON strings under `mixdown:job:<id>`; the version
//! check runs server-side in a small Lua script so concurrent consumers
//! serialise per job. An auxiliary set tracks non-terminal jobs for the
//! timeout sweeper.

use crate::error::CoreError;
use crate::job::Job;
use crate::store::{JobStore, StoredJob};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

const ACTIVE_SET: &str = "mixdown:jobs:active";

fn job_key(job_id: &str) -> String {
    format!("mixdown:job:{}", job_id)
}

// KEYS[1] = job key, ARGV[1] = expected version, ARGV[2] = new document.
// Returns 1 on swap, 0 on version mismatch, -1 when the key is missing.
const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if not cur then return -1 end
local doc = cjson.decode(cur)
if doc.version ~= tonumber(ARGV[1]) then return 0 end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

pub struct RedisStore {
    manager: ConnectionManager,
    cas: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let client = redis::Client::open(url).map_err(|e| CoreError::Store(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;
        Ok(Self {
            manager,
            cas: redis::Script::new(CAS_SCRIPT),
        })
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn insert(&self, job: &Job) -> Result<(), CoreError> {
        let stored = StoredJob {
            version: 1,
            job: job.clone(),
        };
        let payload = serde_json::to_string(&stored)?;
        let mut con = self.manager.clone();
        let created: bool = con
            .set_nx(job_key(&job.job_id), payload)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;
        if !created {
            return Err(CoreError::JobExists(job.job_id.clone()));
        }
        con.sadd::<_, _, ()>(ACTIVE_SET, &job.job_id)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<StoredJob>, CoreError> {
        let mut con = self.manager.clone();
        let raw: Option<String> = con
            .get(job_key(job_id))
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;
        match raw {
            None => Ok(None),
            Some(text) => {
                let stored = serde_json::from_str(&text).map_err(|e| {
                    CoreError::CorruptDocument {
                        id: job_id.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(Some(stored))
            }
        }
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        job: &Job,
    ) -> Result<bool, CoreError> {
        let stored = StoredJob {
            version: expected_version + 1,
            job: job.clone(),
        };
        let payload = serde_json::to_string(&stored)?;
        let mut con = self.manager.clone();
        let verdict: i64 = self
            .cas
            .key(job_key(&job.job_id))
            .arg(expected_version)
            .arg(payload)
            .invoke_async(&mut con)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;
        match verdict {
            -1 => Err(CoreError::JobNotFound(job.job_id.clone())),
            0 => Ok(false),
            _ => {
                if job.status.is_terminal() {
                    // Best effort: the sweeper tolerates stale members.
                    let _ = con.srem::<_, _, ()>(ACTIVE_SET, &job.job_id).await;
                }
                Ok(true)
            }
        }
    }

    async fn active_job_ids(&self) -> Result<Vec<String>, CoreError> {
        let mut con = self.manager.clone();
        let mut ids: Vec<String> = con
            .smembers(ACTIVE_SET)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;
        ids.sort();
        Ok(ids)
    }
}
