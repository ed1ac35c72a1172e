//! The submitted pipeline document, before validation.
//!
//! This is the wire shape clients send: a list of steps naming worker
//! services and command templates, plus explicit transitions routing one
//! step's outputs into another's inputs. The validator turns it into a
//! [`crate::job::Job`] or rejects it; a request is never persisted as-is.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub user_id: String,
    pub steps: Vec<StepRequest>,
    #[serde(default)]
    pub step_transitions: Vec<TransitionRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub name: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_policy: Option<String>,
    pub command_spec: CommandSpecRequest,
    /// placeholder -> literal value, template string, or null when the
    /// placeholder is filled by an incoming transition.
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    /// placeholder -> destination template.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpecRequest {
    pub program: String,
    #[serde(default)]
    pub flags: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub from_step_name: String,
    pub to_step_name: String,
    /// producer output placeholder -> consumer input placeholder
    pub output_to_input_mapping: BTreeMap<String, String>,
}

impl PipelineRequest {
    /// Parse a pipeline from YAML (the CLI surface) or JSON (the API
    /// surface); YAML is a superset, so one entry point covers both.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}
