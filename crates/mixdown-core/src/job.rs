//! The durable job document and its state machine.
//!
//! A job is the persisted form of a submitted pipeline: an ordered list of
//! steps, an ordered list of transitions routing producer outputs into
//! consumer inputs, and the mutable status the engine advances on every
//! status event. All coordination between the planner, dispatcher, and
//! status consumers happens through this document via compare-and-swap.

use crate::error::ErrorObject;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Overall status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Complete,
    Failed,
    Retrying,
}

impl JobStatus {
    /// `failed` is terminal only until an explicit retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

/// Status of a single step (or step instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Dispatched,
    Processing,
    Complete,
    Failed,
    #[serde(rename = "skipped-cached")]
    SkippedCached,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Complete | StepStatus::Failed | StepStatus::SkippedCached
        )
    }

    /// Terminal and usable as a producer binding.
    pub fn is_satisfied(self) -> bool {
        matches!(self, StepStatus::Complete | StepStatus::SkippedCached)
    }

    /// A worker currently owns the step.
    pub fn is_in_flight(self) -> bool {
        matches!(self, StepStatus::Dispatched | StepStatus::Processing)
    }

    /// Legal transitions of the per-step state machine. Status application
    /// is idempotent because an illegal transition is simply refused: a
    /// terminal step ignores late or duplicate outcomes.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        match (self, next) {
            // Ready is transient; the dispatcher may record the dispatch
            // directly.
            (Pending, Ready) | (Pending, Dispatched) | (Pending, SkippedCached) => true,
            (Ready, Dispatched) | (Ready, SkippedCached) => true,
            (Dispatched, Processing) | (Dispatched, Complete) | (Dispatched, Failed) => true,
            (Processing, Complete) | (Processing, Failed) => true,
            // A retry resets a step into pending.
            (Failed, Pending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Ready => "ready",
            StepStatus::Dispatched => "dispatched",
            StepStatus::Processing => "processing",
            StepStatus::Complete => "complete",
            StepStatus::Failed => "failed",
            StepStatus::SkippedCached => "skipped-cached",
        };
        f.write_str(s)
    }
}

/// The executable a worker runs for a step, passed through opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub flags: BTreeMap<String, serde_json::Value>,
}

/// Where a step input placeholder gets its value from.
///
/// Submitted literals resolve immediately; templates resolve once every
/// step they reference has completed; bound placeholders are filled by an
/// incoming transition. Resolution over these variants is total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InputSource {
    Literal(serde_json::Value),
    Template(String),
    Bound,
}

/// One materialised execution of a fanned-out step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInstance {
    pub index: usize,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(default)]
    pub resolved_inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub produced_outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub output_checksums: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl StepInstance {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            status: StepStatus::Pending,
            cache_key: None,
            resolved_inputs: BTreeMap::new(),
            produced_outputs: BTreeMap::new(),
            output_checksums: BTreeMap::new(),
            error: None,
            dispatched_at: None,
        }
    }
}

/// One unit of work for one worker service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub service: String,
    pub command: CommandSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_policy: Option<String>,
    pub inputs: BTreeMap<String, InputSource>,
    pub outputs: BTreeMap<String, String>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    #[serde(default)]
    pub resolved_inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub produced_outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub output_checksums: BTreeMap<String, String>,
    /// Parallel instances when the step has been fanned out. Empty for the
    /// common single-execution case.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<StepInstance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn is_fanned_out(&self) -> bool {
        !self.instances.is_empty()
    }

    pub fn instance(&self, index: usize) -> Option<&StepInstance> {
        self.instances.iter().find(|i| i.index == index)
    }

    pub fn instance_mut(&mut self, index: usize) -> Option<&mut StepInstance> {
        self.instances.iter_mut().find(|i| i.index == index)
    }

    /// Effective status: for a fanned-out step the aggregate over its
    /// instances, otherwise the step's own status.
    pub fn effective_status(&self) -> StepStatus {
        if !self.is_fanned_out() {
            return self.status;
        }
        if self.instances.iter().any(|i| i.status == StepStatus::Failed) {
            StepStatus::Failed
        } else if self.instances.iter().all(|i| i.status.is_satisfied()) {
            StepStatus::Complete
        } else if self.instances.iter().any(|i| i.status.is_in_flight()) {
            StepStatus::Processing
        } else {
            self.status
        }
    }

    /// Outputs of a fanned-out step collected per placeholder, ordered by
    /// instance index. Only meaningful once every instance is satisfied.
    pub fn collected_outputs(&self) -> BTreeMap<String, serde_json::Value> {
        let mut collected: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
        let mut ordered: Vec<&StepInstance> = self.instances.iter().collect();
        ordered.sort_by_key(|i| i.index);
        for inst in ordered {
            for (name, value) in &inst.produced_outputs {
                collected.entry(name.clone()).or_default().push(value.clone());
            }
        }
        collected
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::Array(v)))
            .collect()
    }

    /// A stable, directory-safe identifier for the step, used by workers to
    /// lay out artifact paths.
    pub fn composite_name(&self) -> String {
        let raw = format!("{}-{}-{}", self.service, self.command.program, self.name);
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }
}

/// A typed edge mapping named outputs of a producer to named inputs of a
/// consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    /// producer output placeholder -> consumer input placeholder
    pub mapping: BTreeMap<String, String>,
}

/// The persisted job document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    pub steps: Vec<Step>,
    pub transitions: Vec<Transition>,
    /// Index of the earliest step reset by the most recent retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_index: Option<usize>,
    /// Bumped on every retry; guards the at-most-once terminal transition
    /// per generation.
    #[serde(default)]
    pub retry_generation: u32,
    /// Job-level error, set only for documents the engine can no longer
    /// interpret; step failures live on the steps themselves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

pub fn generate_job_id() -> String {
    let random_part: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("job-{}", random_part.to_lowercase())
}

impl Job {
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Transitions feeding the named consumer step.
    pub fn transitions_into<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Transition> {
        self.transitions.iter().filter(move |t| t.to == name)
    }

    /// Transitions leaving the named producer step.
    pub fn transitions_out_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Transition> {
        self.transitions.iter().filter(move |t| t.from == name)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Key of the fan-in counter for a join step.
    pub fn join_counter_key(&self, step_name: &str) -> String {
        format!("job:{}:join:{}", self.job_id, step_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(name: &str) -> Step {
        Step {
            name: name.to_string(),
            service: "splitter".to_string(),
            command: CommandSpec {
                program: "demucs".to_string(),
                flags: BTreeMap::new(),
            },
            storage_policy: None,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            status: StepStatus::Pending,
            cache_key: None,
            error: None,
            resolved_inputs: BTreeMap::new(),
            produced_outputs: BTreeMap::new(),
            output_checksums: BTreeMap::new(),
            instances: Vec::new(),
            dispatched_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn step_status_transitions() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Ready));
        assert!(StepStatus::Ready.can_transition_to(StepStatus::Dispatched));
        assert!(StepStatus::Dispatched.can_transition_to(StepStatus::Complete));
        assert!(StepStatus::Processing.can_transition_to(StepStatus::Failed));
        assert!(StepStatus::Failed.can_transition_to(StepStatus::Pending));

        // Terminal states ignore further outcomes.
        assert!(!StepStatus::Complete.can_transition_to(StepStatus::Complete));
        assert!(!StepStatus::Complete.can_transition_to(StepStatus::Failed));
        assert!(!StepStatus::SkippedCached.can_transition_to(StepStatus::Dispatched));
        // A reaped step no longer accepts a late worker result.
        assert!(!StepStatus::Failed.can_transition_to(StepStatus::Complete));
    }

    #[test]
    fn effective_status_aggregates_instances() {
        let mut s = step("analyze");
        s.instances = vec![StepInstance::new(0), StepInstance::new(1)];
        s.instances[0].status = StepStatus::Complete;
        s.instances[1].status = StepStatus::Processing;
        assert_eq!(s.effective_status(), StepStatus::Processing);

        s.instances[1].status = StepStatus::Complete;
        assert_eq!(s.effective_status(), StepStatus::Complete);

        s.instances[0].status = StepStatus::Failed;
        assert_eq!(s.effective_status(), StepStatus::Failed);
    }

    #[test]
    fn collected_outputs_preserve_instance_order() {
        let mut s = step("analyze");
        let mut a = StepInstance::new(1);
        a.produced_outputs.insert("report".to_string(), json!("r1"));
        let mut b = StepInstance::new(0);
        b.produced_outputs.insert("report".to_string(), json!("r0"));
        s.instances = vec![a, b];

        let collected = s.collected_outputs();
        assert_eq!(collected["report"], json!(["r0", "r1"]));
    }

    #[test]
    fn composite_name_is_directory_safe() {
        let mut s = step("clip one");
        s.command.program = "ffmpeg/loudnorm".to_string();
        assert_eq!(s.composite_name(), "splitter-ffmpeg-loudnorm-clip-one");
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&StepStatus::SkippedCached).unwrap(),
            "\"skipped-cached\""
        );
        assert_eq!(serde_json::to_string(&JobStatus::Retrying).unwrap(), "\"retrying\"");
    }

    #[test]
    fn job_id_shape() {
        let id = generate_job_id();
        assert!(id.starts_with("job-"));
        assert_eq!(id.len(), 12);
    }
}
