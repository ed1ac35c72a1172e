//! Pipeline validation against the service manifests.
//!
//! A submitted pipeline either normalises into a [`Job`] document ready to
//! be persisted, or is rejected with an error naming the offending
//! step/field. Validation is fatal: a rejected pipeline is never stored.

use crate::template;
use chrono::Utc;
use mixdown_core::job::{
    generate_job_id, CommandSpec, InputSource, Job, JobStatus, Step, StepStatus, Transition,
};
use mixdown_core::manifest::{ManifestSet, ParamKind, ParamSpec};
use mixdown_core::pipeline::PipelineRequest;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("pipeline has no steps")]
    EmptyPipeline,

    #[error("duplicate step name '{0}'")]
    DuplicateStepName(String),

    #[error("step '{step}': unknown service '{service}'")]
    UnknownService { step: String, service: String },

    #[error("step '{step}': service '{service}' has no operation '{program}'")]
    UnknownOperation {
        step: String,
        service: String,
        program: String,
    },

    #[error("step '{step}': missing required parameter '{param}'")]
    MissingParameter { step: String, param: String },

    #[error("step '{step}': parameter '{param}' {reason}")]
    InvalidParameter {
        step: String,
        param: String,
        reason: String,
    },

    #[error("transition references unknown step '{0}'")]
    UnknownTransitionStep(String),

    #[error("transition '{from}' -> '{to}' is a back-edge; producers must precede consumers")]
    BackEdge { from: String, to: String },

    #[error("transition '{from}' -> '{to}': '{from}' declares no output '{output}'")]
    UnknownOutput {
        from: String,
        to: String,
        output: String,
    },

    #[error("transition '{from}' -> '{to}': '{to}' declares no input '{input}'")]
    UnknownInput {
        from: String,
        to: String,
        input: String,
    },

    #[error("step '{step}': input '{input}' is bound more than once")]
    DoubleBoundInput { step: String, input: String },

    #[error("step '{step}': input '{input}' is neither a literal nor bound by a transition")]
    UnboundInput { step: String, input: String },

    #[error("step '{step}': template input '{input}' references unknown step '{referenced}'")]
    TemplateUnknownStep {
        step: String,
        input: String,
        referenced: String,
    },

    #[error(
        "step '{step}': more than one collection-producing transition targets it; \
         a step can only fan out over a single collection"
    )]
    MultipleCollectionInputs { step: String },

    #[error("transition graph contains a cycle")]
    CyclicTransitions,
}

/// Validate a submission and normalise it into a pending job document.
pub fn validate(
    request: &PipelineRequest,
    manifests: &ManifestSet,
) -> Result<Job, ValidationError> {
    if request.steps.is_empty() {
        return Err(ValidationError::EmptyPipeline);
    }

    let mut order: HashMap<&str, usize> = HashMap::new();
    for (idx, step) in request.steps.iter().enumerate() {
        if order.insert(step.name.as_str(), idx).is_some() {
            return Err(ValidationError::DuplicateStepName(step.name.clone()));
        }
    }

    for step in &request.steps {
        check_against_manifest(step, manifests)?;
    }

    // Which consumer inputs the transitions bind, and how often.
    let mut bound: HashMap<(&str, &str), usize> = HashMap::new();
    let mut collection_sources: HashMap<&str, usize> = HashMap::new();

    for t in &request.step_transitions {
        let from_idx = *order
            .get(t.from_step_name.as_str())
            .ok_or_else(|| ValidationError::UnknownTransitionStep(t.from_step_name.clone()))?;
        let to_idx = *order
            .get(t.to_step_name.as_str())
            .ok_or_else(|| ValidationError::UnknownTransitionStep(t.to_step_name.clone()))?;
        if from_idx >= to_idx {
            return Err(ValidationError::BackEdge {
                from: t.from_step_name.clone(),
                to: t.to_step_name.clone(),
            });
        }

        let from = &request.steps[from_idx];
        let to = &request.steps[to_idx];
        for (output, input) in &t.output_to_input_mapping {
            if !from.outputs.contains_key(output) {
                return Err(ValidationError::UnknownOutput {
                    from: t.from_step_name.clone(),
                    to: t.to_step_name.clone(),
                    output: output.clone(),
                });
            }
            if !to.inputs.contains_key(input) {
                return Err(ValidationError::UnknownInput {
                    from: t.from_step_name.clone(),
                    to: t.to_step_name.clone(),
                    input: input.clone(),
                });
            }
            *bound.entry((t.to_step_name.as_str(), input.as_str())).or_insert(0) += 1;
        }

        let emits_collection = manifests
            .operation(&from.service, &from.command_spec.program)
            .map(|op| op.emits_collection)
            .unwrap_or(false);
        if emits_collection && !t.output_to_input_mapping.is_empty() {
            *collection_sources.entry(t.to_step_name.as_str()).or_insert(0) += 1;
        }
    }

    for (step, count) in collection_sources {
        if count > 1 {
            return Err(ValidationError::MultipleCollectionInputs {
                step: step.to_string(),
            });
        }
    }

    // Every input placeholder is bound exactly once: by a literal, a
    // template, or one incoming transition.
    for step in &request.steps {
        for (input, value) in &step.inputs {
            let times_bound = bound
                .get(&(step.name.as_str(), input.as_str()))
                .copied()
                .unwrap_or(0);
            let supplied = !value.is_null();
            if times_bound > 1 || (supplied && times_bound > 0) {
                return Err(ValidationError::DoubleBoundInput {
                    step: step.name.clone(),
                    input: input.clone(),
                });
            }
            if !supplied && times_bound == 0 {
                return Err(ValidationError::UnboundInput {
                    step: step.name.clone(),
                    input: input.clone(),
                });
            }
            if let serde_json::Value::String(text) = value {
                for referenced in template::referenced_steps(text) {
                    let Some(&referenced_idx) = order.get(referenced.as_str()) else {
                        return Err(ValidationError::TemplateUnknownStep {
                            step: step.name.clone(),
                            input: input.clone(),
                            referenced,
                        });
                    };
                    // Template references are edges too: they must point
                    // backwards or the step can never become ready.
                    if referenced_idx >= order[step.name.as_str()] {
                        return Err(ValidationError::BackEdge {
                            from: referenced,
                            to: step.name.clone(),
                        });
                    }
                }
            }
        }
    }

    check_acyclic(request)?;

    Ok(normalise(request, &bound))
}

fn check_against_manifest(
    step: &mixdown_core::pipeline::StepRequest,
    manifests: &ManifestSet,
) -> Result<(), ValidationError> {
    let service = manifests
        .service(&step.service)
        .ok_or_else(|| ValidationError::UnknownService {
            step: step.name.clone(),
            service: step.service.clone(),
        })?;
    let operation = service
        .operations
        .get(&step.command_spec.program)
        .ok_or_else(|| ValidationError::UnknownOperation {
            step: step.name.clone(),
            service: step.service.clone(),
            program: step.command_spec.program.clone(),
        })?;

    for (param, spec) in &operation.parameters {
        match step.command_spec.flags.get(param) {
            None if spec.required => {
                return Err(ValidationError::MissingParameter {
                    step: step.name.clone(),
                    param: param.clone(),
                });
            }
            None => {}
            Some(value) => check_parameter(&step.name, param, value, spec)?,
        }
    }
    for param in step.command_spec.flags.keys() {
        if !operation.parameters.contains_key(param) {
            return Err(ValidationError::InvalidParameter {
                step: step.name.clone(),
                param: param.clone(),
                reason: "is not declared by the operation".to_string(),
            });
        }
    }
    Ok(())
}

fn check_parameter(
    step: &str,
    param: &str,
    value: &serde_json::Value,
    spec: &ParamSpec,
) -> Result<(), ValidationError> {
    let type_error = |expected: &str| ValidationError::InvalidParameter {
        step: step.to_string(),
        param: param.to_string(),
        reason: format!("must be {}", expected),
    };

    let numeric = match spec.kind {
        ParamKind::String => {
            let text = value.as_str().ok_or_else(|| type_error("a string"))?;
            if let Some(choices) = &spec.choices {
                if !choices.iter().any(|c| c == text) {
                    return Err(ValidationError::InvalidParameter {
                        step: step.to_string(),
                        param: param.to_string(),
                        reason: format!("must be one of {:?}", choices),
                    });
                }
            }
            None
        }
        ParamKind::Integer => {
            let n = value.as_i64().ok_or_else(|| type_error("an integer"))?;
            Some(n as f64)
        }
        ParamKind::Float => Some(value.as_f64().ok_or_else(|| type_error("a number"))?),
        ParamKind::Boolean => {
            value.as_bool().ok_or_else(|| type_error("a boolean"))?;
            None
        }
    };

    if let Some(n) = numeric {
        if let Some(min) = spec.min {
            if n < min {
                return Err(ValidationError::InvalidParameter {
                    step: step.to_string(),
                    param: param.to_string(),
                    reason: format!("must be >= {}", min),
                });
            }
        }
        if let Some(max) = spec.max {
            if n > max {
                return Err(ValidationError::InvalidParameter {
                    step: step.to_string(),
                    param: param.to_string(),
                    reason: format!("must be <= {}", max),
                });
            }
        }
    }
    Ok(())
}

fn check_acyclic(request: &PipelineRequest) -> Result<(), ValidationError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut nodes = HashMap::new();
    for step in &request.steps {
        nodes.insert(step.name.as_str(), graph.add_node(step.name.as_str()));
    }
    let mut seen = HashSet::new();
    for t in &request.step_transitions {
        let edge = (t.from_step_name.as_str(), t.to_step_name.as_str());
        if seen.insert(edge) {
            graph.add_edge(nodes[edge.0], nodes[edge.1], ());
        }
    }
    toposort(&graph, None)
        .map(|_| ())
        .map_err(|_| ValidationError::CyclicTransitions)
}

fn normalise(request: &PipelineRequest, bound: &HashMap<(&str, &str), usize>) -> Job {
    let now = Utc::now();
    let steps = request
        .steps
        .iter()
        .map(|s| {
            let inputs = s
                .inputs
                .iter()
                .map(|(name, value)| {
                    let source = if value.is_null() {
                        debug_assert!(bound.contains_key(&(s.name.as_str(), name.as_str())));
                        InputSource::Bound
                    } else if value
                        .as_str()
                        .map(|t| t.contains("{{"))
                        .unwrap_or(false)
                    {
                        InputSource::Template(value.as_str().unwrap_or_default().to_string())
                    } else {
                        InputSource::Literal(value.clone())
                    };
                    (name.clone(), source)
                })
                .collect();
            Step {
                name: s.name.clone(),
                service: s.service.clone(),
                command: CommandSpec {
                    program: s.command_spec.program.clone(),
                    flags: s.command_spec.flags.clone(),
                },
                storage_policy: s.storage_policy.clone(),
                inputs,
                outputs: s.outputs.clone(),
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
        })
        .collect();

    let transitions = request
        .step_transitions
        .iter()
        .map(|t| Transition {
            from: t.from_step_name.clone(),
            to: t.to_step_name.clone(),
            mapping: t.output_to_input_mapping.clone(),
        })
        .collect();

    Job {
        job_id: generate_job_id(),
        user_id: request.user_id.clone(),
        created_at: now,
        updated_at: now,
        status: JobStatus::Pending,
        steps,
        transitions,
        resume_index: None,
        retry_generation: 0,
        error: None,
    }
}
