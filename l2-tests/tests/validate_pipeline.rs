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
fn valid_pipeline_passes() {
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
      out: "hello/out.txt"
"#,
    );

    mixdown_cmd()
        .arg("validate")
        .arg(&pipeline)
        .arg("--manifests")
        .arg(&manifests)
        .assert()
        .success()
        .stdout(predicate::str::contains("pipeline OK: 1 steps"));
}

#[test]
fn unknown_service_is_reported() {
    let dir = tempdir().unwrap();
    let (pipeline, manifests) = write_fixtures(
        dir.path(),
        r#"
user_id: tester
steps:
  - name: hello
    service: transcoder
    command_spec:
      program: echo
    inputs:
      source: "in.wav"
    outputs:
      out: "hello/out.txt"
"#,
    );

    mixdown_cmd()
        .arg("validate")
        .arg(&pipeline)
        .arg("--manifests")
        .arg(&manifests)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown service 'transcoder'"));
}

#[test]
fn unbound_input_is_reported() {
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
      source: null
    outputs:
      out: "hello/out.txt"
"#,
    );

    mixdown_cmd()
        .arg("validate")
        .arg(&pipeline)
        .arg("--manifests")
        .arg(&manifests)
        .assert()
        .failure()
        .stderr(predicate::str::contains("never bound").or(predicate::str::contains("neither a literal")));
}

#[test]
fn show_prints_the_step_graph() {
    let dir = tempdir().unwrap();
    let (pipeline, _) = write_fixtures(
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
        .arg("show")
        .arg(&pipeline)
        .assert()
        .success()
        .stdout(predicate::str::contains("first [shell/echo]"))
        .stdout(predicate::str::contains("out -> second.source"));
}
