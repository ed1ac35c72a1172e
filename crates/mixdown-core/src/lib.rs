//! Durable state and contracts for the mixdown orchestrator: the job
//! document model, service manifests, and the store/bus/cache
//! collaborators the engine coordinates through.

pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod job;
pub mod manifest;
pub mod pipeline;
pub mod store;

pub use bus::{service_queue, Outcome, QueueBus, StatusEvent, StepReady, STATUS_QUEUE};
pub use cache::{CacheEntry, CacheIndex};
pub use config::OrchestratorConfig;
pub use error::{CoreError, ErrorObject, ErrorType};
pub use job::{
    generate_job_id, CommandSpec, InputSource, Job, JobStatus, Step, StepInstance, StepStatus,
    Transition,
};
pub use manifest::{ManifestSet, OperationSpec, ParamKind, ParamSpec, ServiceManifest};
pub use pipeline::{CommandSpecRequest, PipelineRequest, StepRequest, TransitionRequest};
pub use store::{update_job, JobStore, StoredJob};
