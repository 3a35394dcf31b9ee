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
use devsplit::ir::{
    emit_graph, parse_graph, verify_graph, verify_source_graph, Instr, ValueId, VerifyError,
};
use devsplit::partition::{partition_graph, DeviceFunction, TransferIdCounter};
use devsplit::placement::DeviceInfo;

const MODEL: &str = r#"dfg@1 model
# host input pipeline feeding an accelerator
%0 = IteratorGetNext __device="/device:CPU:0"
%1 = Const dtype=f32 shape=[784,10] __device="ALL_DEVICES"
%2 = MatMul %0, %1 __device="/device:GPU:0" __shapes=[[B,784]]
%3 = Softmax %2 __device="/device:GPU:0"
output %3
"#;

fn model_partitions() -> Vec<DeviceFunction> {
    let graph = parse_graph(MODEL).expect("parse");
    verify_source_graph(&graph).expect("valid source");
    let mut info = DeviceInfo::new(DeviceKind::Cpu);
    info.mark_used(DeviceKind::Gpu.into());
    partition_graph(&graph, &info, &mut TransferIdCounter::new())
        .expect("partition")
        .functions
}

#[test]
fn partitions_print_and_reparse() {
    for function in model_partitions() {
        let text = emit_graph(&function.graph);
        let reparsed = parse_graph(&text).expect("reparse emitted function");
        assert_eq!(reparsed.name, function.graph.name);
        assert_eq!(emit_graph(&reparsed), text);
        verify_graph(&reparsed).expect("ssa");
    }
}

#[test]
fn printed_partitions_match_expected_text() {
    let functions = model_partitions();
    let cpu = emit_graph(&functions[0].graph);
    let gpu = emit_graph(&functions[1].graph);

    assert_eq!(
        cpu,
        "dfg@1 model_CPU\n\
         %0 = IteratorGetNext\n\
         %1 = Const dtype=f32 shape=[784,10]\n\
         send %0 transfer=1 dest=\"/device:GPU:0\" __shapes=[[B,784]]\n\
         %4 = recv transfer=2 src=\"/device:GPU:0\"\n\
         output %4\n"
    );
    assert_eq!(
        gpu,
        "dfg@1 model_GPU\n\
         %1 = Const dtype=f32 shape=[784,10]\n\
         %4 = recv transfer=1 src=\"/device:CPU:0\" __shapes=[[B,784]]\n\
         %2 = MatMul %4, %1 __shapes=[[B,784]]\n\
         %3 = Softmax %2\n\
         send %3 transfer=2 dest=\"/device:CPU:0\"\n"
    );
}

#[test]
fn display_matches_emit() {
    let graph = parse_graph(MODEL).expect("parse");
    assert_eq!(graph.to_string(), emit_graph(&graph));
}

#[test]
fn parsed_graphs_are_verified_separately() {
    let graph = parse_graph("dfg@1 g\n%1 = Neg %0\n").expect("syntax is fine");
    assert_eq!(
        verify_graph(&graph),
        Err(VerifyError::UseBeforeDefinition {
            value: ValueId(0),
            instr_index: 0
        })
    );

    let graph = parse_graph("dfg@1 g\n%0 = Const\n%0 = Const\n").expect("syntax is fine");
    assert_eq!(verify_graph(&graph), Err(VerifyError::DuplicateDefinition(ValueId(0))));

    let graph = parse_graph("dfg@1 g\n%0 = recv transfer=1 src=\"/device:CPU:0\"\n")
        .expect("syntax is fine");
    assert!(matches!(graph.instrs[0], Instr::Recv { .. }));
    assert_eq!(
        verify_source_graph(&graph),
        Err(VerifyError::TransferInSourceGraph { instr_index: 0 })
    );
}
