// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::tempdir;

const GRAPH: &str = r#"dfg@1 model
%0 = Const __device="/device:CPU:0"
%1 = Neg %0 __device="/device:GPU:0"
output %1
"#;

fn devsplit() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_devsplit"))
}

fn run(args: &[&str]) -> Output {
    Command::new(devsplit())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("run devsplit")
}

fn write(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, body).expect("write fixture");
    path.to_string_lossy().into_owned()
}

#[test]
fn emits_one_function_per_device() {
    let dir = tempdir().expect("tempdir");
    let input = write(dir.path(), "model.dfg", GRAPH);

    let output = run(&[&input]);
    assert!(
        output.status.success(),
        "devsplit failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("dfg@1 model_CPU"), "{stdout}");
    assert!(stdout.contains("dfg@1 model_GPU"), "{stdout}");
    assert!(stdout.contains("send %0 transfer=1 dest=\"/device:GPU:0\""), "{stdout}");
}

#[test]
fn summary_lists_transfers() {
    let dir = tempdir().expect("tempdir");
    let input = write(dir.path(), "model.dfg", GRAPH);

    let output = run(&[&input, "--emit", "summary"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("function model_CPU ops=1 transfers=2"), "{stdout}");
    assert!(stdout.contains("transfer 1 %0 CPU -> GPU"), "{stdout}");
    assert!(stdout.contains("transfer 2 %1 GPU -> CPU"), "{stdout}");
}

#[test]
fn config_file_sets_first_transfer_id() {
    let dir = tempdir().expect("tempdir");
    let input = write(dir.path(), "model.dfg", GRAPH);
    let config = write(dir.path(), "devsplit.toml", "first_transfer_id = 40\n");

    let output = run(&[&input, "--config", &config, "--emit", "summary"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("transfer 40 %0 CPU -> GPU"), "{stdout}");
}

#[test]
fn infeed_follows_the_flag_and_the_graph() {
    let dir = tempdir().expect("tempdir");
    let input = write(dir.path(), "model.dfg", GRAPH);

    let output = run(&[&input, "--primary", "tpu", "--infeed", "--emit", "summary"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("infeed on"), "{stdout}");

    let output = run(&[&input, "--emit", "summary"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("infeed off"), "{stdout}");

    let configured = write(
        dir.path(),
        "configured.dfg",
        "dfg@1 model\nConfigureDevice device=\"tpu\" infeed=true\n%0 = Const\noutput %0\n",
    );
    let output = run(&[&configured, "--emit", "summary"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("primary TPU"), "{stdout}");
    assert!(stdout.contains("infeed on"), "{stdout}");
    assert!(stdout.contains("function model_TPU ops=1"), "{stdout}");
}

#[test]
fn placement_failure_is_reported_in_short_format() {
    let dir = tempdir().expect("tempdir");
    let input = write(dir.path(), "reader.dfg", "dfg@1 reader\n%0 = ReadFile\n");

    let output = run(&[&input, "--primary", "gpu", "--diagnostic-format", "short"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("reader.dfg:2:1: error[placement][E2002]"), "{stderr}");

    let output = run(&[&input, "--primary", "gpu", "--fallback", "cpu", "--emit", "placed"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("%0 = ReadFile __device=\"/device:CPU:0\""), "{stdout}");
}

#[test]
fn verify_only_reports_parse_errors_as_json() {
    let dir = tempdir().expect("tempdir");
    let input = write(dir.path(), "broken.dfg", "dfg@1 broken\n%0 = \n");

    let output = run(&[&input, "--verify-only", "--diagnostic-format", "json"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    let value: serde_json::Value =
        serde_json::from_str(stderr.trim()).expect("json diagnostic");
    assert_eq!(value["code"], "E1001");
    assert_eq!(value["span"]["line"], 2);
}

#[test]
fn bad_device_names_are_rejected() {
    let dir = tempdir().expect("tempdir");
    let input = write(dir.path(), "model.dfg", GRAPH);

    let output = run(&[&input, "--primary", "npu"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error[config]"), "{stderr}");
}

#[test]
fn devices_subcommand_lists_catalog() {
    let output = run(&["devices"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("/device:GPU:0"));
    assert!(stdout.contains("TPU_SYSTEM"));
    assert!(stdout.contains("ALL_DEVICES"));
}
