//! The dispatcher: turns the planner's ready set into queue messages and
//! cache hits, then records the job's overall verdict.
//!
//! `advance` is the engine's single driver: submission, every status
//! event, retries, and the sweeper all funnel through it. Each pass plans
//! against a fresh snapshot, applies dispatch decisions, and writes the
//! document back with compare-and-swap; queue pushes and counter
//! initialisations run only after the swap sticks, so a lost race never
//! double-publishes. A crash between swap and publish leaves the step
//! `dispatched` with no message, which the timeout sweeper later reaps.

use crate::cache_key::cache_key;
use crate::error::EngineError;
use crate::orchestrator::Orchestrator;
use crate::plan::{self, ReadyStep, Verdict};
use mixdown_core::bus::{service_queue, QueueBus, StepReady};
use mixdown_core::error::CoreError;
use mixdown_core::job::{Job, JobStatus, StepInstance, StepStatus};
use chrono::Utc;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Bus operations deferred until the document swap succeeds. Counters are
/// initialised before messages go out, so a fast worker can never
/// decrement a counter that does not exist yet.
#[derive(Default)]
pub(crate) struct Effects {
    counter_inits: Vec<(String, i64)>,
    pushes: Vec<(String, String)>,
}

impl Effects {
    pub(crate) async fn apply(self, bus: &dyn QueueBus) -> Result<(), CoreError> {
        for (key, n) in self.counter_inits {
            bus.incr_counter(&key, n).await?;
        }
        for (queue, payload) in self.pushes {
            bus.push(&queue, &payload).await?;
        }
        Ok(())
    }
}

enum DispatchOutcome {
    /// Step advanced without touching the bus (cache hit, empty fan-out).
    Advanced,
    /// Messages queued for external workers.
    Dispatched,
    /// Step was no longer pending; nothing to do.
    Skipped,
}

impl Orchestrator {
    /// Plan and dispatch until the job is quiescent, then record the
    /// verdict. Returns the final document snapshot.
    pub(crate) async fn advance(&self, job_id: &str) -> Result<Job, EngineError> {
        loop {
            let stored = self
                .store
                .get(job_id)
                .await?
                .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
            let mut job = stored.job;
            let plan = plan::plan(&job, &self.manifests)?;

            let mut effects = Effects::default();
            let mut dirty = false;
            for ready in &plan.ready {
                match self.prepare_dispatch(&mut job, ready, &mut effects).await? {
                    DispatchOutcome::Advanced | DispatchOutcome::Dispatched => dirty = true,
                    DispatchOutcome::Skipped => {}
                }
            }

            if dirty {
                if matches!(job.status, JobStatus::Pending | JobStatus::Retrying) {
                    job.status = JobStatus::Processing;
                }
            } else {
                // Quiescent pass: record where the job stands.
                let next = match plan.verdict {
                    Verdict::Complete => Some(JobStatus::Complete),
                    Verdict::Failed => Some(JobStatus::Failed),
                    Verdict::InFlight => match job.status {
                        JobStatus::Retrying => Some(JobStatus::Processing),
                        _ => None,
                    },
                };
                if let Some(next) = next {
                    // The compare-and-swap below makes this transition
                    // at-most-once per retry generation.
                    if job.status != next && !job.status.is_terminal() {
                        info!(%job_id, from = %job.status, to = %next, "job status change");
                        job.status = next;
                        dirty = true;
                    }
                }
            }

            if !dirty {
                return Ok(job);
            }
            job.touch();
            if self.store.compare_and_swap(stored.version, &job).await? {
                effects.apply(self.bus.as_ref()).await?;
                continue;
            }
            debug!(%job_id, "lost document race; replanning");
        }
    }

    async fn prepare_dispatch(
        &self,
        job: &mut Job,
        ready: &ReadyStep,
        effects: &mut Effects,
    ) -> Result<DispatchOutcome, EngineError> {
        let (service, program, flags) = {
            let step = job.step(&ready.name).ok_or_else(|| {
                plan::PlanError::Inconsistent(format!("ready step '{}' missing", ready.name))
            })?;
            // Idempotence: dispatch acts on pending steps only; anything
            // else was already handled (or reset by a retry, which puts it
            // back to pending).
            if step.status != StepStatus::Pending {
                return Ok(DispatchOutcome::Skipped);
            }
            (
                step.service.clone(),
                step.command.program.clone(),
                step.command.flags.clone(),
            )
        };
        let operation = self.manifests.operation(&service, &program);
        let deterministic = operation.map(|op| op.deterministic).unwrap_or(false);
        let queue = service_queue(&service);
        let now = Utc::now();

        match &ready.instances {
            None => {
                let mut key = None;
                let mut hit = None;
                if deterministic {
                    let k = cache_key(&service, &program, &flags, &ready.input_checksums);
                    hit = self.cache.lookup(&k).await?;
                    key = Some(k);
                }

                let job_id = job.job_id.clone();
                let step = job.step_mut(&ready.name).expect("step vanished mid-pass");
                step.resolved_inputs = ready.resolved_inputs.clone();
                step.cache_key = key;
                match hit {
                    Some(entry) => {
                        info!(job_id = %job_id, step = %ready.name, "cache hit; skipping dispatch");
                        step.status = StepStatus::SkippedCached;
                        step.produced_outputs = entry.outputs;
                        step.output_checksums = entry.output_checksums;
                        step.finished_at = Some(now);
                        Ok(DispatchOutcome::Advanced)
                    }
                    None => {
                        step.status = StepStatus::Dispatched;
                        step.dispatched_at = Some(now);
                        let message = StepReady {
                            job_id: job.job_id.clone(),
                            step_name: ready.name.clone(),
                            instance_index: None,
                        };
                        effects
                            .pushes
                            .push((queue, serde_json::to_string(&message).map_err(CoreError::from)?));
                        debug!(job_id = %job.job_id, step = %ready.name, "step dispatched");
                        Ok(DispatchOutcome::Dispatched)
                    }
                }
            }
            Some(plans) if plans.is_empty() => {
                // A collection producer emitted zero elements: the fanned
                // step is trivially complete with empty collections.
                let step = job.step_mut(&ready.name).expect("step vanished mid-pass");
                step.resolved_inputs = ready.resolved_inputs.clone();
                step.status = StepStatus::Complete;
                step.finished_at = Some(now);
                let placeholders: Vec<String> = step.outputs.keys().cloned().collect();
                for placeholder in placeholders {
                    step.produced_outputs
                        .insert(placeholder, serde_json::Value::Array(Vec::new()));
                }
                Ok(DispatchOutcome::Advanced)
            }
            Some(plans) => {
                let mut instances = Vec::with_capacity(plans.len());
                let mut dispatched = 0i64;
                for instance_plan in plans {
                    let mut instance = StepInstance::new(instance_plan.index);
                    instance.resolved_inputs = instance_plan.resolved_inputs.clone();
                    let mut hit = None;
                    if deterministic {
                        let k =
                            cache_key(&service, &program, &flags, &instance_plan.input_checksums);
                        hit = self.cache.lookup(&k).await?;
                        instance.cache_key = Some(k);
                    }
                    match hit {
                        Some(entry) => {
                            instance.status = StepStatus::SkippedCached;
                            instance.produced_outputs = entry.outputs;
                            instance.output_checksums = entry.output_checksums;
                        }
                        None => {
                            instance.status = StepStatus::Dispatched;
                            instance.dispatched_at = Some(now);
                            dispatched += 1;
                            let message = StepReady {
                                job_id: job.job_id.clone(),
                                step_name: ready.name.clone(),
                                instance_index: Some(instance_plan.index),
                            };
                            effects.pushes.push((
                                queue.clone(),
                                serde_json::to_string(&message).map_err(CoreError::from)?,
                            ));
                        }
                    }
                    instances.push(instance);
                }

                if dispatched > 0 {
                    // Fan-in counters for every downstream join, one per
                    // consumer, initialised before any message goes out.
                    let consumers: BTreeSet<String> = job
                        .transitions_out_of(&ready.name)
                        .map(|t| t.to.clone())
                        .collect();
                    for consumer in consumers {
                        effects
                            .counter_inits
                            .push((job.join_counter_key(&consumer), dispatched));
                    }
                }

                info!(
                    job_id = %job.job_id,
                    step = %ready.name,
                    instances = plans.len(),
                    dispatched,
                    "step fanned out"
                );
                let step = job.step_mut(&ready.name).expect("step vanished mid-pass");
                step.resolved_inputs = ready.resolved_inputs.clone();
                step.instances = instances;
                if dispatched > 0 {
                    step.status = StepStatus::Dispatched;
                    step.dispatched_at = Some(now);
                    Ok(DispatchOutcome::Dispatched)
                } else {
                    step.status = StepStatus::SkippedCached;
                    step.finished_at = Some(now);
                    Ok(DispatchOutcome::Advanced)
                }
            }
        }
    }
}
