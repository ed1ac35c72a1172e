use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

// Helper function to get the path to the compiled `mixdown` binary.
fn mixdown_cmd() -> Command {
    Command::cargo_bin("mixdown").unwrap()
}

const MANIFESTS: &str = r#"
- service: shell
  operations:
    echo:
      deterministic: false
    "false":
      deterministic: false
"#;

fn write_fixtures(dir: &Path, pipeline: &str) -> (String, String) {
    let manifests = dir.join("manifests.yml");
    let pipeline_file = dir.join("pipeline.yml");
    fs::write(&manifests, MANIFESTS).unwrap();
    fs::write(&pipeline_file, pipeline).unwrap();
    (
        pipeline_file.to_string_lossy().into_owned(),
        manifests.to_string_lossy().into_owned(),
    )
}

#[test]
fn single_step_pipeline_runs_to_completion() {
    let dir = tempdir().unwrap();
    let (pipeline, manifests) = write_fixtures(
        dir.path(),
        r#"
user_id: tester
steps:
  - name: hello
    service: shell
    command_spec:
      program: echo
    inputs:
      source: "in.wav"
    outputs:
      out: "{{composite_name}}/out.txt"
"#,
    );

    mixdown_cmd()
        .arg("run")
        .arg(&pipeline)
        .arg("--manifests")
        .arg(&manifests)
        .arg("--timeout")
        .arg("30")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"complete\""))
        .stdout(predicate::str::contains("shell-echo-hello/out.txt"));
}

#[test]
fn chained_pipeline_routes_outputs_between_steps() {
    let dir = tempdir().unwrap();
    let (pipeline, manifests) = write_fixtures(
        dir.path(),
        r#"
user_id: tester
steps:
  - name: first
    service: shell
    command_spec:
      program: echo
    inputs:
      source: "in.wav"
    outputs:
      out: "first/out.txt"
  - name: second
    service: shell
    command_spec:
      program: echo
    inputs:
      source: null
    outputs:
      out: "second/out.txt"
step_transitions:
  - from_step_name: first
    to_step_name: second
    output_to_input_mapping:
      out: source
"#,
    );

    mixdown_cmd()
        .arg("run")
        .arg(&pipeline)
        .arg("--manifests")
        .arg(&manifests)
        .arg("--timeout")
        .arg("30")
        .assert()
        .success()
        // The second step's input was bound to the first step's output
        // reference.
        .stdout(predicate::str::contains("\"resolved_inputs\""))
        .stdout(predicate::str::contains("first/out.txt"));
}

#[test]
fn failing_step_fails_the_job() {
    let dir = tempdir().unwrap();
    let (pipeline, manifests) = write_fixtures(
        dir.path(),
        r#"
user_id: tester
steps:
  - name: broken
    service: shell
    command_spec:
      program: "false"
    inputs:
      source: "in.wav"
    outputs:
      out: "broken/out.txt"
"#,
    );

    mixdown_cmd()
        .arg("run")
        .arg(&pipeline)
        .arg("--manifests")
        .arg(&manifests)
        .arg("--timeout")
        .arg("30")
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"status\": \"failed\""))
        .stdout(predicate::str::contains("tool_exit"));
}
