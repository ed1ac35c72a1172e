//! Placeholder substitution over the job document.
//!
//! Supports the `{{ <path> }}` syntax for:
//! - `{{user_id}}`, `{{job_id}}`
//! - `{{composite_name}}` (the step's directory-safe identifier)
//! - `{{steps.<name>.outputs.<placeholder>}}`
//!
//! Substitution is a pure function over the document; it either resolves
//! every placeholder or fails naming the first unresolvable one.

use mixdown_core::job::{Job, Step};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("invalid template expression '{0}'")]
    InvalidExpression(String),

    #[error("template references unknown step '{0}'")]
    UnknownStep(String),

    #[error("step '{step}' has not produced output '{output}'")]
    MissingOutput { step: String, output: String },
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").unwrap())
}

/// Render a JSON value into template output: bare strings stay bare,
/// everything else becomes its JSON text.
fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitute every placeholder in `text` against the job document, with
/// `step` as the current step (for `composite_name`).
pub fn substitute(text: &str, job: &Job, step: &Step) -> Result<String, TemplateError> {
    let mut result = text.to_string();
    for cap in placeholder_pattern().captures_iter(text) {
        let expr = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
        let value = evaluate(expr, job, step)?;
        let full = cap.get(0).map(|m| m.as_str()).unwrap_or_default();
        result = result.replace(full, &value);
    }
    Ok(result)
}

fn evaluate(expr: &str, job: &Job, step: &Step) -> Result<String, TemplateError> {
    let parts: Vec<&str> = expr.split('.').collect();
    match parts.as_slice() {
        ["user_id"] => Ok(job.user_id.clone()),
        ["job_id"] => Ok(job.job_id.clone()),
        ["composite_name"] => Ok(step.composite_name()),
        ["steps", name, "outputs", output] => {
            let producer = job
                .step(name)
                .ok_or_else(|| TemplateError::UnknownStep(name.to_string()))?;
            let outputs = if producer.is_fanned_out() {
                producer.collected_outputs()
            } else {
                producer.produced_outputs.clone()
            };
            outputs
                .get(*output)
                .map(value_to_text)
                .ok_or_else(|| TemplateError::MissingOutput {
                    step: name.to_string(),
                    output: output.to_string(),
                })
        }
        _ => Err(TemplateError::InvalidExpression(expr.to_string())),
    }
}

/// Steps a template depends on: the `<name>` of every
/// `steps.<name>.outputs.<ph>` reference. Used for readiness checks and
/// retry-closure computation.
pub fn referenced_steps(text: &str) -> Vec<String> {
    let mut steps = Vec::new();
    for cap in placeholder_pattern().captures_iter(text) {
        let expr = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
        let parts: Vec<&str> = expr.split('.').collect();
        if let ["steps", name, "outputs", _] = parts.as_slice() {
            if !steps.iter().any(|s| s == name) {
                steps.push(name.to_string());
            }
        }
    }
    steps
}

/// Whether every step a template references has completed, so the
/// template can be resolved.
pub fn is_resolvable(text: &str, job: &Job) -> bool {
    referenced_steps(text).iter().all(|name| {
        job.step(name)
            .map(|s| s.effective_status().is_satisfied())
            .unwrap_or(false)
    })
}
