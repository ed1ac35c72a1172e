//! The status consumer: drains `job_status_events` and applies worker
//! outcomes to the job documents.
//!
//! Consumers run as a pool; any consumer may apply any job's events.
//! Outcome application is idempotent through the step state machine (a
//! terminal step refuses further outcomes) and serialised per job by the
//! store's compare-and-swap, so duplicates and races are harmless.

use crate::error::EngineError;
use crate::orchestrator::Orchestrator;
use chrono::Utc;
use mixdown_core::bus::{Outcome, StatusEvent, STATUS_QUEUE};
use mixdown_core::cache::CacheEntry;
use mixdown_core::job::StepStatus;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const APPLY_ATTEMPTS: u32 = 3;
const APPLY_BACKOFF: Duration = Duration::from_millis(200);

impl Orchestrator {
    /// Long-lived consumer loop; one per pool worker.
    pub(crate) async fn consume_status_events(&self, worker: usize, shutdown: watch::Receiver<bool>) {
        debug!(worker, "status consumer started");
        loop {
            if *shutdown.borrow() {
                debug!(worker, "status consumer stopping");
                return;
            }
            let payload = match self.bus.pop(STATUS_QUEUE, self.config.pop_timeout()).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker, error = %e, "status queue pop failed");
                    tokio::time::sleep(APPLY_BACKOFF).await;
                    continue;
                }
            };

            let event: StatusEvent = match serde_json::from_str(&payload) {
                Ok(event) => event,
                Err(e) => {
                    // A malformed message can never become applicable;
                    // requeueing it would loop forever.
                    error!(worker, error = %e, "dropping malformed status event");
                    continue;
                }
            };

            let mut applied = false;
            let mut delay = APPLY_BACKOFF;
            for attempt in 0..APPLY_ATTEMPTS {
                match self.apply_status_event(&event).await {
                    Ok(()) => {
                        applied = true;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            worker,
                            attempt,
                            job_id = %event.job_id,
                            step = %event.step_name,
                            error = %e,
                            "failed to apply status event"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
            if !applied {
                // Exhausted retries: hand the message back to the queue
                // for redelivery rather than losing the outcome.
                if let Err(e) = self.bus.push(STATUS_QUEUE, &payload).await {
                    error!(worker, error = %e, "could not requeue status event");
                }
            }
        }
    }

    /// Apply one worker outcome: record it on the step (or instance),
    /// write the cache entry, decrement join counters, and re-plan.
    pub async fn apply_status_event(&self, event: &StatusEvent) -> Result<(), EngineError> {
        let next = match event.outcome {
            Outcome::Complete => StepStatus::Complete,
            Outcome::Failed => StepStatus::Failed,
        };

        // Record the outcome on the document first.
        let (cache_write, join_decrements) = loop {
            let Some(stored) = self.store.get(&event.job_id).await? else {
                warn!(job_id = %event.job_id, "status event for unknown job; dropping");
                return Ok(());
            };
            let mut job = stored.job;
            let mut cache_write: Option<(String, CacheEntry)> = None;
            let mut join_decrements: Vec<String> = Vec::new();

            let job_id = job.job_id.clone();
            let Some(step) = job.step_mut(&event.step_name) else {
                warn!(%job_id, step = %event.step_name, "status event for unknown step; dropping");
                return Ok(());
            };
            let service = step.service.clone();
            let program = step.command.program.clone();

            let (current, key) = match event.instance_index {
                Some(index) => {
                    let Some(instance) = step.instance_mut(index) else {
                        warn!(%job_id, step = %event.step_name, index, "status event for unknown instance; dropping");
                        return Ok(());
                    };
                    (instance.status, instance.cache_key.clone())
                }
                None => (step.status, step.cache_key.clone()),
            };

            if !current.can_transition_to(next) {
                // Duplicate, late, or already-reaped outcome.
                debug!(
                    %job_id,
                    step = %event.step_name,
                    current = %current,
                    incoming = %next,
                    "ignoring inapplicable status event"
                );
                return Ok(());
            }

            let now = Utc::now();
            match event.instance_index {
                Some(index) => {
                    let instance = step.instance_mut(index).expect("instance checked above");
                    instance.status = next;
                    instance.produced_outputs = event.outputs.clone();
                    instance.output_checksums = event.output_checksums.clone();
                    instance.error = event.error.clone();
                }
                None => {
                    step.status = next;
                    step.produced_outputs = event.outputs.clone();
                    step.output_checksums = event.output_checksums.clone();
                    step.error = event.error.clone();
                    step.finished_at = Some(now);
                }
            }
            if step.is_fanned_out() && step.effective_status().is_terminal() {
                step.finished_at = Some(now);
            }

            if next == StepStatus::Complete {
                if let (Some(key), Some(op)) = (key, self.manifests.operation(&service, &program)) {
                    if op.deterministic {
                        cache_write = Some((
                            key,
                            CacheEntry {
                                outputs: event.outputs.clone(),
                                output_checksums: event.output_checksums.clone(),
                                produced_at: now,
                                ttl_secs: op.cache_ttl_secs,
                            },
                        ));
                    }
                }
                if event.instance_index.is_some() {
                    let consumers: BTreeSet<String> = job
                        .transitions_out_of(&event.step_name)
                        .map(|t| t.to.clone())
                        .collect();
                    for consumer in consumers {
                        join_decrements.push(job.join_counter_key(&consumer));
                    }
                }
            } else if let Some(err) = &event.error {
                info!(
                    %job_id,
                    step = %event.step_name,
                    code = %err.error_code,
                    "step failed: {}", err.error_message
                );
            }

            job.touch();
            if self.store.compare_and_swap(stored.version, &job).await? {
                break (cache_write, join_decrements);
            }
        };

        if let Some((key, entry)) = cache_write {
            let ttl = Duration::from_secs(entry.ttl_secs);
            if let Err(e) = self.cache.put(&key, entry, ttl).await {
                // The cache is an optimisation; losing a write only costs
                // a future recomputation.
                warn!(job_id = %event.job_id, error = %e, "cache write failed");
            }
        }
        for key in join_decrements {
            let remaining = self.bus.decr_counter(&key).await?;
            if remaining == 0 {
                info!(job_id = %event.job_id, counter = %key, "join satisfied");
                self.bus.clear_counter(&key).await?;
            }
        }

        self.advance(&event.job_id).await?;
        Ok(())
    }
}
