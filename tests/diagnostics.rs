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

use devsplit::device::DeviceKind;
use devsplit::diagnostics::{
    ColorChoice, Diagnostic, DiagnosticEmitter, DiagnosticFormat, Severity, Span,
};
use devsplit::ir::parse_graph;
use devsplit::kernels::KernelRegistry;
use devsplit::placement::{place_graph, DeviceInfo};

fn sample_diag() -> Diagnostic {
    Diagnostic {
        phase: "placement",
        code: "E2002",
        severity: Severity::Error,
        message: "no available device supports operation 'ReadFile'".to_string(),
        span: Some(Span {
            file: Some("model.dfg".to_string()),
            line: 2,
            column: 6,
            length: 8,
        }),
        notes: vec!["devices considered: GPU".to_string()],
        help: Some("allow a fallback device".to_string()),
    }
}

#[test]
fn human_output_smoke() {
    let diag = sample_diag();
    let emitter = DiagnosticEmitter::new(DiagnosticFormat::Human, ColorChoice::Never);
    let rendered = emitter.render_human(&diag, Some("dfg@1 model\n%0 = ReadFile path=\"x\"\n"));

    assert!(rendered.contains("error[placement][E2002]"));
    assert!(rendered.contains("model.dfg:2:6"));
    assert!(rendered.contains("2 | %0 = ReadFile"));
    assert!(rendered.contains("^^^^^^^^"));
    assert!(rendered.contains("note: devices considered: GPU"));
    assert!(rendered.contains("help: allow a fallback device"));
}

#[test]
fn short_output_is_one_line() {
    let emitter = DiagnosticEmitter::new(DiagnosticFormat::Short, ColorChoice::Never);
    let rendered = emitter.render_short(&sample_diag());
    assert_eq!(
        rendered,
        "model.dfg:2:6: error[placement][E2002]: no available device supports operation 'ReadFile'"
    );
}

#[test]
fn json_output_smoke() {
    let diag = sample_diag();
    let emitter = DiagnosticEmitter::new(DiagnosticFormat::Json, ColorChoice::Never);
    let mut buf = Vec::new();
    emitter.emit(&diag, None, &mut buf);
    let body = String::from_utf8(buf).expect("utf8");
    let value: serde_json::Value = serde_json::from_str(body.trim()).expect("json diagnostic");

    assert_eq!(value["phase"], "placement");
    assert_eq!(value["code"], "E2002");
    assert_eq!(value["severity"], "error");
    assert_eq!(value["span"]["file"], "model.dfg");
    assert_eq!(value["span"]["line"], 2);
    assert_eq!(value["span"]["column"], 6);
    assert_eq!(value["notes"][0], "devices considered: GPU");
}

#[test]
fn placement_failures_point_at_the_op_line() {
    let mut graph = parse_graph("dfg@1 g\n# reader\n%0 = ReadFile\n").expect("parse");
    let mut info = DeviceInfo::new(DeviceKind::Tpu);
    let diags = place_graph(&mut graph, &mut info, &KernelRegistry::default()).unwrap_err();

    assert_eq!(diags.len(), 1);
    let span = diags[0].span.as_ref().expect("span");
    assert_eq!(span.line, 3);
    assert_eq!(diags[0].notes, vec!["devices considered: TPU".to_string()]);
}
