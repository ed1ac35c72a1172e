//! Error types shared across the orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the durable collaborators (store, bus, cache).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("job '{0}' already exists")]
    JobExists(String),

    #[error("job document for '{id}' is corrupt: {reason}")]
    CorruptDocument { id: String, reason: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Distinguishes worker-logic failures from environment failures.
///
/// Application errors are only retryable by explicit user action;
/// infrastructure errors are produced by the orchestrator itself
/// (timeouts, unreachable collaborators).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    ApplicationError,
    InfrastructureError,
}

/// Structured error recorded on a failed step and surfaced in the job
/// document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub error_type: ErrorType,
    pub error_code: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorObject {
    pub fn application(code: &str, message: impl Into<String>) -> Self {
        Self {
            error_type: ErrorType::ApplicationError,
            error_code: code.to_string(),
            error_message: message.into(),
            details: None,
        }
    }

    pub fn infrastructure(code: &str, message: impl Into<String>) -> Self {
        Self {
            error_type: ErrorType::InfrastructureError,
            error_code: code.to_string(),
            error_message: message.into(),
            details: None,
        }
    }
}

/// Error code recorded when a job document can no longer be deserialized.
pub const CORRUPT_DOCUMENT_CODE: &str = "corrupt_document";

/// Error code recorded by the sweeper when a step exceeds its timeout.
pub const STEP_TIMEOUT_CODE: &str = "step_timeout";
