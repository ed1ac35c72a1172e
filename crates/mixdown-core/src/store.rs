//! The job store: durable job-id -> job document mapping.
//!
//! The store is the only source of truth for pipeline state. Mutations are
//! serialised per job through an optimistic compare-and-swap on a document
//! version; unrelated jobs proceed independently.

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

use crate::error::CoreError;
use crate::job::Job;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A job document plus the version number its CAS is keyed on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredJob {
    pub version: u64,
    pub job: Job,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job at version 1. Fails if the id already exists.
    async fn insert(&self, job: &Job) -> Result<(), CoreError>;

    async fn get(&self, job_id: &str) -> Result<Option<StoredJob>, CoreError>;

    /// Replace the document iff its stored version still equals
    /// `expected_version`. Returns `false` on a lost race; callers reload
    /// and re-apply.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        job: &Job,
    ) -> Result<bool, CoreError>;

    /// Ids of jobs not yet in a terminal state, for the timeout sweeper.
    async fn active_job_ids(&self) -> Result<Vec<String>, CoreError>;
}

/// Load-modify-CAS loop shared by every component that mutates a job.
/// `apply` returns `Ok(true)` to request a write, `Ok(false)` to leave the
/// document untouched.
pub async fn update_job<S, F>(store: &S, job_id: &str, mut apply: F) -> Result<Job, CoreError>
where
    S: JobStore + ?Sized,
    F: FnMut(&mut Job) -> Result<bool, CoreError>,
{
    loop {
        let stored = store
            .get(job_id)
            .await?
            .ok_or_else(|| CoreError::JobNotFound(job_id.to_string()))?;
        let mut job = stored.job;
        if !apply(&mut job)? {
            return Ok(job);
        }
        job.touch();
        if store.compare_and_swap(stored.version, &job).await? {
            return Ok(job);
        }
        // Version moved under us; reload and re-apply.
    }
}
