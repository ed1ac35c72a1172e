use mixdown_core::job::{InputSource, JobStatus, StepStatus};
use mixdown_core::manifest::{ManifestSet, OperationSpec, ParamKind, ParamSpec, ServiceManifest};
use mixdown_core::pipeline::PipelineRequest;
use mixdown_engine::validate::{validate, ValidationError};
use std::collections::BTreeMap;

fn manifests() -> ManifestSet {
    let mut demucs_params = BTreeMap::new();
    demucs_params.insert(
        "stems".to_string(),
        ParamSpec {
            kind: ParamKind::Integer,
            required: true,
            min: Some(2.0),
            max: Some(6.0),
            choices: None,
        },
    );
    demucs_params.insert(
        "model".to_string(),
        ParamSpec {
            kind: ParamKind::String,
            required: false,
            min: None,
            max: None,
            choices: Some(vec!["htdemucs".to_string(), "mdx".to_string()]),
        },
    );
    ManifestSet::new(vec![
        ServiceManifest {
            service: "splitter".to_string(),
            operations: BTreeMap::from([(
                "demucs".to_string(),
                OperationSpec {
                    parameters: demucs_params,
                    deterministic: true,
                    cache_ttl_secs: 3600,
                    timeout_secs: None,
                    emits_collection: true,
                },
            )]),
        },
        ServiceManifest {
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
        },
    ])
}

fn parse(yaml: &str) -> PipelineRequest {
    PipelineRequest::from_yaml(yaml).unwrap()
}

const VALID: &str = r#"
user_id: user-1
steps:
  - name: split
    service: splitter
    command_spec:
      program: demucs
      flags:
        stems: 4
        model: htdemucs
    inputs:
      source: "take.wav"
    outputs:
      stems: "split/stems"
  - name: analyze
    service: analysis
    command_spec:
      program: keyfinder
    inputs:
      stem: null
    outputs:
      report: "analyze/report.json"
step_transitions:
  - from_step_name: split
    to_step_name: analyze
    output_to_input_mapping:
      stems: stem
"#;

#[test]
fn valid_pipeline_normalises_into_pending_job() {
    let job = validate(&parse(VALID), &manifests()).unwrap();

    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.job_id.starts_with("job-"));
    assert_eq!(job.steps.len(), 2);
    assert_eq!(job.transitions.len(), 1);

    let split = job.step("split").unwrap();
    assert_eq!(split.status, StepStatus::Pending);
    assert!(matches!(split.inputs["source"], InputSource::Literal(_)));

    let analyze = job.step("analyze").unwrap();
    assert!(matches!(analyze.inputs["stem"], InputSource::Bound));
}

#[test]
fn template_inputs_are_classified() {
    let yaml = r#"
user_id: user-1
steps:
  - name: split
    service: splitter
    command_spec:
      program: demucs
      flags:
        stems: 4
    inputs:
      source: "take.wav"
    outputs:
      stems: "split/stems"
  - name: analyze
    service: analysis
    command_spec:
      program: keyfinder
    inputs:
      stem: "{{steps.split.outputs.stems}}"
    outputs:
      report: "r.json"
"#;
    let job = validate(&parse(yaml), &manifests()).unwrap();
    assert!(matches!(
        job.step("analyze").unwrap().inputs["stem"],
        InputSource::Template(_)
    ));
}

#[test]
fn empty_pipeline_is_rejected() {
    let request = parse("user_id: user-1\nsteps: []\n");
    assert_eq!(
        validate(&request, &manifests()).unwrap_err(),
        ValidationError::EmptyPipeline
    );
}

#[test]
fn duplicate_step_names_are_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: split
    service: splitter
    command_spec: { program: demucs, flags: { stems: 4 } }
    inputs: { source: "a.wav" }
    outputs: { stems: "s" }
  - name: split
    service: splitter
    command_spec: { program: demucs, flags: { stems: 4 } }
    inputs: { source: "b.wav" }
    outputs: { stems: "s" }
"#;
    assert_eq!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::DuplicateStepName("split".to_string())
    );
}

#[test]
fn unknown_service_is_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: x
    service: transcriber
    command_spec: { program: whisper }
    inputs: { source: "a.wav" }
    outputs: { text: "t" }
"#;
    assert_eq!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::UnknownService {
            step: "x".to_string(),
            service: "transcriber".to_string()
        }
    );
}

#[test]
fn unknown_operation_is_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: x
    service: splitter
    command_spec: { program: spleeter }
    inputs: { source: "a.wav" }
    outputs: { stems: "s" }
"#;
    assert!(matches!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::UnknownOperation { .. }
    ));
}

#[test]
fn missing_required_parameter_is_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: split
    service: splitter
    command_spec: { program: demucs }
    inputs: { source: "a.wav" }
    outputs: { stems: "s" }
"#;
    assert_eq!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::MissingParameter {
            step: "split".to_string(),
            param: "stems".to_string()
        }
    );
}

#[test]
fn out_of_range_parameter_is_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: split
    service: splitter
    command_spec: { program: demucs, flags: { stems: 12 } }
    inputs: { source: "a.wav" }
    outputs: { stems: "s" }
"#;
    assert!(matches!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::InvalidParameter { ref param, .. } if param == "stems"
    ));
}

#[test]
fn wrong_parameter_type_is_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: split
    service: splitter
    command_spec: { program: demucs, flags: { stems: "four" } }
    inputs: { source: "a.wav" }
    outputs: { stems: "s" }
"#;
    assert!(matches!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::InvalidParameter { ref param, .. } if param == "stems"
    ));
}

#[test]
fn parameter_outside_choices_is_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: split
    service: splitter
    command_spec: { program: demucs, flags: { stems: 4, model: unknown } }
    inputs: { source: "a.wav" }
    outputs: { stems: "s" }
"#;
    assert!(matches!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::InvalidParameter { ref param, .. } if param == "model"
    ));
}

#[test]
fn undeclared_parameter_is_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: split
    service: splitter
    command_spec: { program: demucs, flags: { stems: 4, verbosity: 3 } }
    inputs: { source: "a.wav" }
    outputs: { stems: "s" }
"#;
    assert!(matches!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::InvalidParameter { ref param, .. } if param == "verbosity"
    ));
}

#[test]
fn transition_to_unknown_step_is_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: split
    service: splitter
    command_spec: { program: demucs, flags: { stems: 4 } }
    inputs: { source: "a.wav" }
    outputs: { stems: "s" }
step_transitions:
  - from_step_name: split
    to_step_name: ghost
    output_to_input_mapping: { stems: stem }
"#;
    assert_eq!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::UnknownTransitionStep("ghost".to_string())
    );
}

#[test]
fn back_edge_is_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: analyze
    service: analysis
    command_spec: { program: keyfinder }
    inputs: { stem: null }
    outputs: { report: "r" }
  - name: split
    service: splitter
    command_spec: { program: demucs, flags: { stems: 4 } }
    inputs: { source: "a.wav" }
    outputs: { stems: "s" }
step_transitions:
  - from_step_name: split
    to_step_name: analyze
    output_to_input_mapping: { stems: stem }
"#;
    assert_eq!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::BackEdge {
            from: "split".to_string(),
            to: "analyze".to_string()
        }
    );
}

#[test]
fn transition_from_undeclared_output_is_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: split
    service: splitter
    command_spec: { program: demucs, flags: { stems: 4 } }
    inputs: { source: "a.wav" }
    outputs: { stems: "s" }
  - name: analyze
    service: analysis
    command_spec: { program: keyfinder }
    inputs: { stem: null }
    outputs: { report: "r" }
step_transitions:
  - from_step_name: split
    to_step_name: analyze
    output_to_input_mapping: { vocals: stem }
"#;
    assert!(matches!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::UnknownOutput { ref output, .. } if output == "vocals"
    ));
}

#[test]
fn transition_to_undeclared_input_is_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: split
    service: splitter
    command_spec: { program: demucs, flags: { stems: 4 } }
    inputs: { source: "a.wav" }
    outputs: { stems: "s" }
  - name: analyze
    service: analysis
    command_spec: { program: keyfinder }
    inputs: { stem: null }
    outputs: { report: "r" }
step_transitions:
  - from_step_name: split
    to_step_name: analyze
    output_to_input_mapping: { stems: track }
"#;
    assert!(matches!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::UnknownInput { ref input, .. } if input == "track"
    ));
}

#[test]
fn double_bound_input_is_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: split
    service: splitter
    command_spec: { program: demucs, flags: { stems: 4 } }
    inputs: { source: "a.wav" }
    outputs: { stems: "s" }
  - name: analyze
    service: analysis
    command_spec: { program: keyfinder }
    inputs: { stem: "already-supplied.wav" }
    outputs: { report: "r" }
step_transitions:
  - from_step_name: split
    to_step_name: analyze
    output_to_input_mapping: { stems: stem }
"#;
    assert_eq!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::DoubleBoundInput {
            step: "analyze".to_string(),
            input: "stem".to_string()
        }
    );
}

#[test]
fn unbound_input_is_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: analyze
    service: analysis
    command_spec: { program: keyfinder }
    inputs: { stem: null }
    outputs: { report: "r" }
"#;
    assert_eq!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::UnboundInput {
            step: "analyze".to_string(),
            input: "stem".to_string()
        }
    );
}

#[test]
fn template_referencing_unknown_step_is_rejected() {
    let yaml = r#"
user_id: user-1
steps:
  - name: analyze
    service: analysis
    command_spec: { program: keyfinder }
    inputs: { stem: "{{steps.ghost.outputs.stems}}" }
    outputs: { report: "r" }
"#;
    assert!(matches!(
        validate(&parse(yaml), &manifests()).unwrap_err(),
        ValidationError::TemplateUnknownStep { ref referenced, .. } if referenced == "ghost"
    ));
}

#[test]
fn rejected_pipelines_never_become_jobs() {
    // The validator returns before a job id is ever minted; this is the
    // "fatal on any violation" contract.
    let request = parse("user_id: user-1\nsteps: []\n");
    assert!(validate(&request, &manifests()).is_err());
}
