//! Engine-level error type.

use crate::plan::PlanError;
use crate::template::TemplateError;
use crate::validate::ValidationError;
use mixdown_core::error::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("job '{job}' has no step '{step}'")]
    StepNotFound { job: String, step: String },

    #[error("step '{step}' has no instance {index}")]
    InstanceNotFound { step: String, index: usize },

    #[error("job '{job}' is {status}; only failed jobs can be retried")]
    NotRetryable { job: String, status: String },

    #[error("step '{step}' is {status}; hydration requires a dispatched or processing step")]
    NotHydratable { step: String, status: String },
}
