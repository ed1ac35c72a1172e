//! A local worker for embedded runs: pops service queues, hydrates steps
//! through the orchestration API, shells the command out, and reports the
//! outcome on the status queue.
//!
//! This is development glue. Production workers are separate processes
//! that speak the same queue/hydration contract against shared
//! infrastructure.

use mixdown_core::bus::{service_queue, Outcome, QueueBus, StatusEvent, StepReady, STATUS_QUEUE};
use mixdown_core::error::ErrorObject;
use mixdown_engine::{HydratedStep, Orchestrator};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const POP_TIMEOUT: Duration = Duration::from_millis(250);

pub struct LocalWorker {
    orchestrator: Orchestrator,
    bus: Arc<dyn QueueBus>,
    service: String,
}

impl LocalWorker {
    pub fn new(orchestrator: Orchestrator, bus: Arc<dyn QueueBus>, service: &str) -> Self {
        Self {
            orchestrator,
            bus,
            service: service.to_string(),
        }
    }

    /// Drain the service queue until told to stop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let queue = service_queue(&self.service);
        debug!(service = %self.service, "local worker started");
        loop {
            if *shutdown.borrow_and_update() {
                return;
            }
            let popped = match self.bus.pop(&queue, POP_TIMEOUT).await {
                Ok(popped) => popped,
                Err(e) => {
                    warn!(service = %self.service, error = %e, "queue pop failed");
                    continue;
                }
            };
            let Some(payload) = popped else { continue };
            let message: StepReady = match serde_json::from_str(&payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!(service = %self.service, error = %e, "dropping malformed message");
                    continue;
                }
            };
            self.execute(&message).await;
        }
    }

    async fn execute(&self, message: &StepReady) {
        let hydrated = match self
            .orchestrator
            .hydrate(&message.job_id, &message.step_name, message.instance_index)
            .await
        {
            Ok(hydrated) => hydrated,
            Err(e) => {
                // Usually a reaped or reset step; the engine has moved on.
                warn!(step = %message.step_name, error = %e, "hydration refused");
                return;
            }
        };

        info!(
            job_id = %message.job_id,
            step = %message.step_name,
            instance = ?message.instance_index,
            program = %hydrated.command_spec.program,
            "executing step"
        );
        let event = match run_command(&hydrated).await {
            Ok(()) => StatusEvent {
                job_id: message.job_id.clone(),
                step_name: message.step_name.clone(),
                instance_index: message.instance_index,
                outcome: Outcome::Complete,
                outputs: hydrated
                    .outputs
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect(),
                output_checksums: checksum_outputs(&hydrated.outputs),
                error: None,
            },
            Err(error) => StatusEvent {
                job_id: message.job_id.clone(),
                step_name: message.step_name.clone(),
                instance_index: message.instance_index,
                outcome: Outcome::Failed,
                outputs: BTreeMap::new(),
                output_checksums: BTreeMap::new(),
                error: Some(error),
            },
        };

        match serde_json::to_string(&event) {
            Ok(payload) => {
                if let Err(e) = self.bus.push(STATUS_QUEUE, &payload).await {
                    warn!(step = %message.step_name, error = %e, "could not report outcome");
                }
            }
            Err(e) => warn!(error = %e, "could not serialize status event"),
        }
    }
}

/// Build a shell command line from the hydrated context and run it.
/// Inputs and outputs are exported as environment variables so command
/// templates can reference them.
async fn run_command(hydrated: &HydratedStep) -> Result<(), ErrorObject> {
    let mut line = hydrated.command_spec.program.clone();
    for (flag, value) in &hydrated.parameters {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        line.push_str(&format!(" --{} {}", flag, rendered));
    }

    let mut command = Command::new("sh");
    command.arg("-c").arg(&line);
    for (name, value) in &hydrated.resolved_inputs {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        command.env(format!("MIXDOWN_INPUT_{}", name.to_uppercase()), rendered);
    }
    for (name, destination) in &hydrated.outputs {
        command.env(format!("MIXDOWN_OUTPUT_{}", name.to_uppercase()), destination);
    }
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let output = command.output().await.map_err(|e| {
        ErrorObject::infrastructure("spawn_failed", format!("could not spawn '{}': {}", line, e))
    })?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let preview: String = stderr.chars().take(200).collect();
        Err(ErrorObject::application(
            "tool_exit",
            format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(1),
                preview
            ),
        ))
    }
}

/// Checksum produced artifacts where they exist on disk; fall back to the
/// destination path so the value is still stable.
fn checksum_outputs(outputs: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    outputs
        .iter()
        .map(|(name, destination)| {
            let mut hasher = Sha256::new();
            match std::fs::read(Path::new(destination)) {
                Ok(bytes) => hasher.update(&bytes),
                Err(_) => hasher.update(destination.as_bytes()),
            }
            (name.clone(), format!("sha256:{:x}", hasher.finalize()))
        })
        .collect()
}
