//! The queue bus: named FIFO queues plus the small arithmetic primitive
//! backing fan-in joins.
//!
//! Queue payloads are thin: identifiers only, never step data. Workers
//! hydrate their full step context through the orchestration API, so the
//! job store stays the single source of truth and parameter edits
//! propagate to retries.

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

use crate::error::{CoreError, ErrorObject};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Name of the queue carrying worker status replies.
pub const STATUS_QUEUE: &str = "job_status_events";

/// Queue a service's workers subscribe to.
pub fn service_queue(service: &str) -> String {
    format!("{}_queue", service)
}

/// Message telling a worker that one step (instance) is ready to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReady {
    pub job_id: String,
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_index: Option<usize>,
}

/// Worker-reported outcome of a step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Complete,
    Failed,
}

/// Status reply a worker pushes onto [`STATUS_QUEUE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub job_id: String,
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_index: Option<usize>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Content checksums of the produced outputs, folded into downstream
    /// cache keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_checksums: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Named FIFO queues with blocking pop, plus atomic counters keyed by
/// (job, join step). Every call may suspend; this is the engine's only
/// coordination fabric besides the job store.
#[async_trait]
pub trait QueueBus: Send + Sync {
    async fn declare(&self, queue: &str) -> Result<(), CoreError>;

    async fn push(&self, queue: &str, payload: &str) -> Result<(), CoreError>;

    /// Blocking pop with a timeout; `None` on timeout.
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, CoreError>;

    /// Atomically add `delta` to a counter, creating it at zero first.
    /// Returns the new value.
    async fn incr_counter(&self, key: &str, delta: i64) -> Result<i64, CoreError>;

    /// Atomic decrement-and-get: the happens-before edge for fan-in joins.
    async fn decr_counter(&self, key: &str) -> Result<i64, CoreError>;

    async fn clear_counter(&self, key: &str) -> Result<(), CoreError>;
}
