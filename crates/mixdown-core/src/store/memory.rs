//! In-process job store used by tests and the CLI's embedded mode.

use crate::error::CoreError;
use crate::job::Job;
use crate::store::{JobStore, StoredJob};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<Mutex<HashMap<String, StoredJob>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: &Job) -> Result<(), CoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.job_id) {
            return Err(CoreError::JobExists(job.job_id.clone()));
        }
        jobs.insert(
            job.job_id.clone(),
            StoredJob {
                version: 1,
                job: job.clone(),
            },
        );
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<StoredJob>, CoreError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.get(job_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        job: &Job,
    ) -> Result<bool, CoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&job.job_id) {
            None => Err(CoreError::JobNotFound(job.job_id.clone())),
            Some(stored) if stored.version != expected_version => Ok(false),
            Some(stored) => {
                stored.version += 1;
                stored.job = job.clone();
                Ok(true)
            }
        }
    }

    async fn active_job_ids(&self) -> Result<Vec<String>, CoreError> {
        let jobs = self.jobs.lock().await;
        let mut ids: Vec<String> = jobs
            .values()
            .filter(|s| !s.job.status.is_terminal())
            .map(|s| s.job.job_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
