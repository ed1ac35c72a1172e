//! The orchestration API: create, inspect, and retry jobs; hydrate step
//! context for workers; run the long-lived consumer pool and sweeper.

use crate::error::EngineError;
use crate::template;
use crate::validate;
use mixdown_core::bus::{service_queue, QueueBus, STATUS_QUEUE};
use mixdown_core::cache::CacheIndex;
use mixdown_core::config::OrchestratorConfig;
use mixdown_core::error::{CoreError, ErrorObject, CORRUPT_DOCUMENT_CODE};
use mixdown_core::job::{CommandSpec, Job, JobStatus, StepStatus};
use mixdown_core::manifest::ManifestSet;
use mixdown_core::pipeline::PipelineRequest;
use mixdown_core::store::JobStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Response to a submission: the new job's identity and initial status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub status: JobStatus,
}

/// Response to a retry request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryReceipt {
    pub status: JobStatus,
    pub resume_step: String,
}

/// A fully bound step context, the worker's sole source of instructions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydratedStep {
    pub command_spec: CommandSpec,
    pub resolved_inputs: BTreeMap<String, serde_json::Value>,
    /// Output placeholder -> destination path, templates substituted.
    pub outputs: BTreeMap<String, String>,
    /// Command flags with templates substituted.
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// The job orchestration engine. Cheap to clone; all state lives in the
/// store, the bus, and the cache.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) bus: Arc<dyn QueueBus>,
    pub(crate) cache: Arc<dyn CacheIndex>,
    pub(crate) manifests: Arc<ManifestSet>,
    pub(crate) config: Arc<OrchestratorConfig>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        bus: Arc<dyn QueueBus>,
        cache: Arc<dyn CacheIndex>,
        manifests: ManifestSet,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            bus,
            cache,
            manifests: Arc::new(manifests),
            config: Arc::new(config),
        }
    }

    /// Declare every queue this orchestrator produces or consumes. Called
    /// once at startup, before any submission.
    pub async fn init(&self) -> Result<(), EngineError> {
        self.bus.declare(STATUS_QUEUE).await?;
        for service in self.manifests.service_names() {
            self.bus.declare(&service_queue(service)).await?;
        }
        Ok(())
    }

    /// Validate and persist a pipeline, then dispatch its first wave.
    pub async fn submit(&self, request: &PipelineRequest) -> Result<SubmitReceipt, EngineError> {
        let job = validate::validate(request, &self.manifests)?;
        let job_id = job.job_id.clone();
        self.store.insert(&job).await?;
        info!(%job_id, user_id = %job.user_id, steps = job.steps.len(), "job accepted");

        let job = self.advance(&job_id).await?;
        Ok(SubmitReceipt {
            job_id,
            status: job.status,
        })
    }

    /// Read-only snapshot of the job document; safe to poll. A document
    /// that can no longer be deserialized still surfaces to the caller,
    /// as a failed job with the distinguished `corrupt_document` code.
    pub async fn job(&self, job_id: &str) -> Result<Job, EngineError> {
        match self.store.get(job_id).await {
            Ok(Some(stored)) => Ok(stored.job),
            Ok(None) => Err(EngineError::JobNotFound(job_id.to_string())),
            Err(CoreError::CorruptDocument { id, reason }) => {
                tracing::error!(job_id = %id, %reason, "job document is corrupt");
                let now = chrono::Utc::now();
                Ok(Job {
                    job_id: id,
                    user_id: String::new(),
                    created_at: now,
                    updated_at: now,
                    status: JobStatus::Failed,
                    steps: Vec::new(),
                    transitions: Vec::new(),
                    resume_index: None,
                    retry_generation: 0,
                    error: Some(ErrorObject::infrastructure(CORRUPT_DOCUMENT_CODE, reason)),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Build the fully substituted step context for a worker. Hydrating a
    /// dispatched step marks it processing: the worker has picked it up.
    pub async fn hydrate(
        &self,
        job_id: &str,
        step_name: &str,
        instance_index: Option<usize>,
    ) -> Result<HydratedStep, EngineError> {
        // Flip dispatched -> processing first, so the sweeper and late
        // status events see the handoff.
        let job = loop {
            let stored = self
                .store
                .get(job_id)
                .await?
                .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
            let mut job = stored.job;
            let step = job
                .step_mut(step_name)
                .ok_or_else(|| EngineError::StepNotFound {
                    job: job_id.to_string(),
                    step: step_name.to_string(),
                })?;

            let status = match instance_index {
                Some(index) => {
                    step.instance(index)
                        .ok_or_else(|| EngineError::InstanceNotFound {
                            step: step_name.to_string(),
                            index,
                        })?
                        .status
                }
                None => step.status,
            };
            match status {
                StepStatus::Processing => break job,
                StepStatus::Dispatched => {}
                other => {
                    return Err(EngineError::NotHydratable {
                        step: step_name.to_string(),
                        status: other.to_string(),
                    })
                }
            }

            match instance_index {
                Some(index) => {
                    if let Some(instance) = step.instance_mut(index) {
                        instance.status = StepStatus::Processing;
                    }
                }
                None => step.status = StepStatus::Processing,
            }
            job.touch();
            if self.store.compare_and_swap(stored.version, &job).await? {
                break job;
            }
        };

        let step = job.step(step_name).ok_or_else(|| EngineError::StepNotFound {
            job: job_id.to_string(),
            step: step_name.to_string(),
        })?;
        let resolved_inputs = match instance_index {
            Some(index) => {
                step.instance(index)
                    .ok_or_else(|| EngineError::InstanceNotFound {
                        step: step_name.to_string(),
                        index,
                    })?
                    .resolved_inputs
                    .clone()
            }
            None => step.resolved_inputs.clone(),
        };

        let mut outputs = BTreeMap::new();
        for (placeholder, destination) in &step.outputs {
            outputs.insert(
                placeholder.clone(),
                template::substitute(destination, &job, step)?,
            );
        }
        let mut parameters = BTreeMap::new();
        for (flag, value) in &step.command.flags {
            let substituted = match value.as_str() {
                Some(text) if text.contains("{{") => {
                    serde_json::Value::String(template::substitute(text, &job, step)?)
                }
                _ => value.clone(),
            };
            parameters.insert(flag.clone(), substituted);
        }

        Ok(HydratedStep {
            command_spec: step.command.clone(),
            resolved_inputs,
            outputs,
            parameters,
        })
    }

    /// Spawn the status-consumer pool and the timeout sweeper. The
    /// returned handle shuts them down cleanly.
    pub fn run(&self) -> OrchestratorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        for worker in 0..self.config.consumer_pool_size {
            let engine = self.clone();
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                engine.consume_status_events(worker, rx).await;
            }));
        }

        let engine = self.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            engine.run_sweeper(rx).await;
        }));

        info!(
            consumers = self.config.consumer_pool_size,
            "orchestrator running"
        );
        OrchestratorHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Handle to the background tasks spawned by [`Orchestrator::run`].
pub struct OrchestratorHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl OrchestratorHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task panicked during shutdown");
            }
        }
    }
}
