//! The graph planner: a pure function from the job document to the sets
//! of ready, blocked, and terminal work.
//!
//! The planner never touches the store or the bus; it only reads the
//! document and the manifests. The dispatcher and status consumer apply
//! its output. Re-planning happens on every status event, because
//! completions arrive asynchronously from external workers.

use crate::cache_key::{element_checksum, literal_checksum};
use crate::template;
use mixdown_core::job::{InputSource, Job, Step, StepStatus};
use mixdown_core::manifest::ManifestSet;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("job document inconsistent: {0}")]
    Inconsistent(String),
}

/// Where the job as a whole stands after this planning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Every step is complete or skipped-cached.
    Complete,
    /// At least one step failed and nothing is in flight or dispatchable.
    Failed,
    /// Work remains: ready, dispatched, or blocked-on-pending steps.
    InFlight,
}

/// One parallel instance of a fanned-out ready step.
#[derive(Debug, Clone)]
pub struct InstancePlan {
    pub index: usize,
    pub resolved_inputs: BTreeMap<String, serde_json::Value>,
    pub input_checksums: BTreeMap<String, String>,
}

/// A step whose inputs are all bound and which should now be dispatched.
#[derive(Debug, Clone)]
pub struct ReadyStep {
    pub name: String,
    pub resolved_inputs: BTreeMap<String, serde_json::Value>,
    pub input_checksums: BTreeMap<String, String>,
    /// `Some` when the step fans out into parallel instances.
    pub instances: Option<Vec<InstancePlan>>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    /// Dispatchable steps, in declared order.
    pub ready: Vec<ReadyStep>,
    /// Pending steps still missing inputs (or stuck behind a failure).
    pub blocked: Vec<String>,
    pub verdict: Verdict,
}

pub fn plan(job: &Job, manifests: &ManifestSet) -> Result<Plan, PlanError> {
    let mut ready = Vec::new();
    let mut blocked = Vec::new();

    for step in &job.steps {
        if step.status != StepStatus::Pending {
            continue;
        }
        match assess(job, step, manifests)? {
            Assessment::Ready(ready_step) => ready.push(ready_step),
            Assessment::Blocked => blocked.push(step.name.clone()),
        }
    }

    let any_failed = job
        .steps
        .iter()
        .any(|s| s.effective_status() == StepStatus::Failed);
    let any_in_flight = job
        .steps
        .iter()
        .any(|s| s.effective_status().is_in_flight());
    let all_satisfied = job
        .steps
        .iter()
        .all(|s| s.effective_status().is_satisfied());

    let verdict = if all_satisfied {
        Verdict::Complete
    } else if any_failed && !any_in_flight && ready.is_empty() {
        Verdict::Failed
    } else {
        Verdict::InFlight
    };

    Ok(Plan {
        ready,
        blocked,
        verdict,
    })
}

enum Assessment {
    Ready(ReadyStep),
    Blocked,
}

/// A collection-valued binding that fans the consumer out.
struct CollectionBinding {
    input: String,
    elements: Vec<serde_json::Value>,
    checksum: String,
}

fn assess(job: &Job, step: &Step, manifests: &ManifestSet) -> Result<Assessment, PlanError> {
    // A failed predecessor permanently blocks its dependents; a retry is
    // the only way out.
    for t in job.transitions_into(&step.name) {
        let producer = job.step(&t.from).ok_or_else(|| {
            PlanError::Inconsistent(format!("transition from unknown step '{}'", t.from))
        })?;
        if producer.effective_status() == StepStatus::Failed {
            return Ok(Assessment::Blocked);
        }
    }

    let mut resolved = BTreeMap::new();
    let mut checksums = BTreeMap::new();
    let mut collection: Option<CollectionBinding> = None;

    for (input, source) in &step.inputs {
        match source {
            InputSource::Literal(value) => {
                resolved.insert(input.clone(), value.clone());
                checksums.insert(input.clone(), literal_checksum(value));
            }
            InputSource::Template(text) => {
                for referenced in template::referenced_steps(text) {
                    let producer = job.step(&referenced).ok_or_else(|| {
                        PlanError::Inconsistent(format!(
                            "template references unknown step '{}'",
                            referenced
                        ))
                    })?;
                    if producer.effective_status() == StepStatus::Failed {
                        return Ok(Assessment::Blocked);
                    }
                }
                if !template::is_resolvable(text, job) {
                    return Ok(Assessment::Blocked);
                }
                let value = template::substitute(text, job, step)
                    .map_err(|e| PlanError::Inconsistent(e.to_string()))?;
                let value = serde_json::Value::String(value);
                checksums.insert(input.clone(), literal_checksum(&value));
                resolved.insert(input.clone(), value);
            }
            InputSource::Bound => match bound_value(job, step, input, manifests)? {
                None => return Ok(Assessment::Blocked),
                Some(BoundValue::Plain { value, checksum }) => {
                    resolved.insert(input.clone(), value);
                    checksums.insert(input.clone(), checksum);
                }
                Some(BoundValue::Collection { elements, checksum }) => {
                    collection = Some(CollectionBinding {
                        input: input.clone(),
                        elements,
                        checksum,
                    });
                }
            },
        }
    }

    let instances = collection.map(|c| {
        c.elements
            .iter()
            .enumerate()
            .map(|(k, element)| {
                let mut inputs = resolved.clone();
                inputs.insert(c.input.clone(), element.clone());
                let mut sums = checksums.clone();
                sums.insert(c.input.clone(), element_checksum(&c.checksum, k));
                InstancePlan {
                    index: k,
                    resolved_inputs: inputs,
                    input_checksums: sums,
                }
            })
            .collect()
    });

    Ok(Assessment::Ready(ReadyStep {
        name: step.name.clone(),
        resolved_inputs: resolved,
        input_checksums: checksums,
        instances,
    }))
}

enum BoundValue {
    Plain {
        value: serde_json::Value,
        checksum: String,
    },
    /// Produced by an `emits_collection` operation; the consumer fans out
    /// one instance per element.
    Collection {
        elements: Vec<serde_json::Value>,
        checksum: String,
    },
}

/// Resolve a transition-bound input. `None` while the producer has not
/// completed yet.
fn bound_value(
    job: &Job,
    step: &Step,
    input: &str,
    manifests: &ManifestSet,
) -> Result<Option<BoundValue>, PlanError> {
    let (transition, output) = job
        .transitions_into(&step.name)
        .find_map(|t| {
            t.mapping
                .iter()
                .find(|(_, i)| i.as_str() == input)
                .map(|(o, _)| (t, o.clone()))
        })
        .ok_or_else(|| {
            PlanError::Inconsistent(format!(
                "step '{}': no transition binds input '{}'",
                step.name, input
            ))
        })?;

    let producer = job.step(&transition.from).ok_or_else(|| {
        PlanError::Inconsistent(format!("transition from unknown step '{}'", transition.from))
    })?;
    if !producer.effective_status().is_satisfied() {
        return Ok(None);
    }

    if producer.is_fanned_out() {
        // Fan-in: the consumer joins the collected instance outputs.
        let collected = producer.collected_outputs();
        let value = collected.get(&output).cloned().ok_or_else(|| {
            PlanError::Inconsistent(format!(
                "step '{}' produced no output '{}'",
                producer.name, output
            ))
        })?;
        let joined = producer
            .instances
            .iter()
            .map(|i| i.output_checksums.get(&output).cloned().unwrap_or_default())
            .collect::<Vec<_>>()
            .join("+");
        return Ok(Some(BoundValue::Plain {
            value,
            checksum: format!("join:{}", joined),
        }));
    }

    let value = producer
        .produced_outputs
        .get(&output)
        .cloned()
        .ok_or_else(|| {
            PlanError::Inconsistent(format!(
                "step '{}' produced no output '{}'",
                producer.name, output
            ))
        })?;
    let checksum = producer
        .output_checksums
        .get(&output)
        .cloned()
        .unwrap_or_else(|| literal_checksum(&value));

    // Fan-out is explicit: only a manifest-declared collection producer
    // fans its consumers out, and only with an array-valued output.
    let emits_collection = manifests
        .operation(&producer.service, &producer.command.program)
        .map(|op| op.emits_collection)
        .unwrap_or(false);

    if emits_collection && value.is_array() {
        let elements = value.as_array().cloned().unwrap_or_default();
        Ok(Some(BoundValue::Collection { elements, checksum }))
    } else {
        Ok(Some(BoundValue::Plain { value, checksum }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mixdown_core::job::{CommandSpec, JobStatus, StepInstance, Transition};
    use mixdown_core::manifest::{OperationSpec, ServiceManifest};
    use serde_json::json;

    fn manifests() -> ManifestSet {
        let splitter = ServiceManifest {
            service: "splitter".to_string(),
            operations: BTreeMap::from([(
                "demucs".to_string(),
                OperationSpec {
                    parameters: BTreeMap::new(),
                    deterministic: false,
                    cache_ttl_secs: 3600,
                    timeout_secs: None,
                    emits_collection: true,
                },
            )]),
        };
        let analysis = ServiceManifest {
            service: "analysis".to_string(),
            operations: BTreeMap::from([(
                "keyfinder".to_string(),
                OperationSpec {
                    parameters: BTreeMap::new(),
                    deterministic: false,
                    cache_ttl_secs: 3600,
                    timeout_secs: None,
                    emits_collection: false,
                },
            )]),
        };
        ManifestSet::new(vec![splitter, analysis])
    }

    fn step(name: &str, service: &str, program: &str) -> Step {
        Step {
            name: name.to_string(),
            service: service.to_string(),
            command: CommandSpec {
                program: program.to_string(),
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

    fn job(steps: Vec<Step>, transitions: Vec<Transition>) -> Job {
        Job {
            job_id: "job-test0001".to_string(),
            user_id: "user-1".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            status: JobStatus::Processing,
            steps,
            transitions,
            resume_index: None,
            retry_generation: 0,
            error: None,
        }
    }

    fn transition(from: &str, to: &str, output: &str, input: &str) -> Transition {
        Transition {
            from: from.to_string(),
            to: to.to_string(),
            mapping: BTreeMap::from([(output.to_string(), input.to_string())]),
        }
    }

    #[test]
    fn literal_only_step_is_ready_immediately() {
        let mut a = step("a", "analysis", "keyfinder");
        a.inputs
            .insert("source".to_string(), InputSource::Literal(json!("in.wav")));
        let j = job(vec![a], vec![]);

        let p = plan(&j, &manifests()).unwrap();
        assert_eq!(p.ready.len(), 1);
        assert_eq!(p.ready[0].resolved_inputs["source"], json!("in.wav"));
        assert!(p.ready[0].instances.is_none());
        assert_eq!(p.verdict, Verdict::InFlight);
    }

    #[test]
    fn consumer_blocked_until_producer_completes() {
        let mut a = step("a", "analysis", "keyfinder");
        a.inputs
            .insert("source".to_string(), InputSource::Literal(json!("in.wav")));
        a.outputs.insert("out".to_string(), "a/out.wav".to_string());
        let mut b = step("b", "analysis", "keyfinder");
        b.inputs.insert("source".to_string(), InputSource::Bound);
        let t = transition("a", "b", "out", "source");
        let mut j = job(vec![a, b], vec![t]);

        let p = plan(&j, &manifests()).unwrap();
        assert_eq!(p.ready.len(), 1);
        assert_eq!(p.blocked, vec!["b".to_string()]);

        // Producer completes; consumer becomes ready with its output bound.
        {
            let a = j.step_mut("a").unwrap();
            a.status = StepStatus::Complete;
            a.produced_outputs.insert("out".to_string(), json!("x"));
            a.output_checksums
                .insert("out".to_string(), "sha256:aa".to_string());
        }
        let p = plan(&j, &manifests()).unwrap();
        assert_eq!(p.ready.len(), 1);
        assert_eq!(p.ready[0].name, "b");
        assert_eq!(p.ready[0].resolved_inputs["source"], json!("x"));
        assert_eq!(p.ready[0].input_checksums["source"], "sha256:aa");
    }

    #[test]
    fn failed_predecessor_blocks_dependent_and_fails_job() {
        let mut a = step("a", "analysis", "keyfinder");
        a.status = StepStatus::Failed;
        a.outputs.insert("out".to_string(), String::new());
        let mut b = step("b", "analysis", "keyfinder");
        b.inputs.insert("source".to_string(), InputSource::Bound);
        let t = transition("a", "b", "out", "source");
        let j = job(vec![a, b], vec![t]);

        let p = plan(&j, &manifests()).unwrap();
        assert!(p.ready.is_empty());
        assert_eq!(p.blocked, vec!["b".to_string()]);
        assert_eq!(p.verdict, Verdict::Failed);
    }

    #[test]
    fn failure_waits_for_in_flight_siblings_to_drain() {
        let mut a = step("a", "analysis", "keyfinder");
        a.status = StepStatus::Failed;
        let mut c = step("c", "analysis", "keyfinder");
        c.status = StepStatus::Processing;
        let j = job(vec![a, c], vec![]);

        assert_eq!(plan(&j, &manifests()).unwrap().verdict, Verdict::InFlight);
    }

    #[test]
    fn collection_producer_fans_consumer_out() {
        let mut split = step("split", "splitter", "demucs");
        split.status = StepStatus::Complete;
        split.outputs.insert("stems".to_string(), String::new());
        split
            .produced_outputs
            .insert("stems".to_string(), json!(["s0", "s1", "s2", "s3"]));
        split
            .output_checksums
            .insert("stems".to_string(), "sha256:cc".to_string());
        let mut analyze = step("analyze", "analysis", "keyfinder");
        analyze.inputs.insert("stem".to_string(), InputSource::Bound);
        let t = transition("split", "analyze", "stems", "stem");
        let j = job(vec![split, analyze], vec![t]);

        let p = plan(&j, &manifests()).unwrap();
        let ready = &p.ready[0];
        let instances = ready.instances.as_ref().unwrap();
        assert_eq!(instances.len(), 4);
        assert_eq!(instances[2].resolved_inputs["stem"], json!("s2"));
        assert_eq!(instances[2].input_checksums["stem"], "sha256:cc#2");
    }

    #[test]
    fn join_waits_for_every_instance() {
        let mut analyze = step("analyze", "analysis", "keyfinder");
        analyze.status = StepStatus::Processing;
        analyze.outputs.insert("report".to_string(), String::new());
        let mut i0 = StepInstance::new(0);
        i0.status = StepStatus::Complete;
        i0.produced_outputs.insert("report".to_string(), json!("r0"));
        let mut i1 = StepInstance::new(1);
        i1.status = StepStatus::Processing;
        analyze.instances = vec![i0, i1];

        let mut aggregate = step("aggregate", "analysis", "keyfinder");
        aggregate
            .inputs
            .insert("reports".to_string(), InputSource::Bound);
        let t = transition("analyze", "aggregate", "report", "reports");
        let mut j = job(vec![analyze, aggregate], vec![t]);

        let p = plan(&j, &manifests()).unwrap();
        assert!(p.ready.is_empty());
        assert_eq!(p.blocked, vec!["aggregate".to_string()]);

        // Final instance lands; the join binds the collected array.
        {
            let analyze = j.step_mut("analyze").unwrap();
            let i1 = analyze.instance_mut(1).unwrap();
            i1.status = StepStatus::Complete;
            i1.produced_outputs.insert("report".to_string(), json!("r1"));
        }
        let p = plan(&j, &manifests()).unwrap();
        assert_eq!(p.ready.len(), 1);
        assert_eq!(p.ready[0].resolved_inputs["reports"], json!(["r0", "r1"]));
    }

    #[test]
    fn template_input_resolves_after_producer() {
        let mut a = step("a", "analysis", "keyfinder");
        a.outputs.insert("out".to_string(), String::new());
        let mut b = step("b", "analysis", "keyfinder");
        b.inputs.insert(
            "source".to_string(),
            InputSource::Template("{{steps.a.outputs.out}}-suffix".to_string()),
        );
        let mut j = job(vec![a, b], vec![]);

        let p = plan(&j, &manifests()).unwrap();
        assert_eq!(p.blocked, vec!["b".to_string()]);

        {
            let a = j.step_mut("a").unwrap();
            a.status = StepStatus::Complete;
            a.produced_outputs.insert("out".to_string(), json!("val"));
        }
        let p = plan(&j, &manifests()).unwrap();
        assert_eq!(p.ready[0].resolved_inputs["source"], json!("val-suffix"));
    }

    #[test]
    fn verdict_complete_when_everything_satisfied() {
        let mut a = step("a", "analysis", "keyfinder");
        a.status = StepStatus::Complete;
        let mut b = step("b", "analysis", "keyfinder");
        b.status = StepStatus::SkippedCached;
        let j = job(vec![a, b], vec![]);

        assert_eq!(plan(&j, &manifests()).unwrap().verdict, Verdict::Complete);
    }
}
