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

//! Dataflow graph IR consumed and produced by the partitioner.
//!
//! Operations are opaque: the pass only needs their type name, operands,
//! results, and attributes. Two attribute keys are reserved and assumed never
//! to clash with an operation's own attributes: [`DEVICE_ATTR`] carries the
//! placement and [`SHAPE_ARRAY_ATTR`] carries transfer shape metadata.

pub mod text;
pub mod verify;

use std::fmt;

use crate::device::{DeviceError, DeviceKind, Placement};
use crate::types::ShapeDim;

pub use text::{emit_graph, parse_graph, ParseError};
pub use verify::{
    verify_device_function, verify_graph, verify_source_graph, verify_transfers, VerifyError,
};

/// Placement annotation key.
pub const DEVICE_ATTR: &str = "__device";

/// Shape metadata key. Propagated from an op onto the transfers of its
/// results; lowering uses it for device feed/fetch primitives and drops it
/// everywhere else.
pub const SHAPE_ARRAY_ATTR: &str = "__shapes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub usize);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Identifier shared by one send and its matching receive(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One shape per transferred tensor.
pub type ShapeArray = Vec<Vec<ShapeDim>>;

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Type(crate::types::DType),
    Shape(Vec<ShapeDim>),
    ShapeArray(ShapeArray),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttrValue,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: AttrValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Device annotation naming `placement`.
    pub fn device(placement: Placement) -> Self {
        Self::new(DEVICE_ATTR, AttrValue::Str(placement.identifier().to_string()))
    }
}

/// True when `name` is the shape-array key and `value` is an array of shapes.
pub fn is_shape_array_pseudo_attr(name: &str, value: &AttrValue) -> bool {
    name == SHAPE_ARRAY_ATTR && matches!(value, AttrValue::ShapeArray(_))
}

/// A single operation of the source graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphOp {
    pub op_type: String,
    pub results: Vec<ValueId>,
    pub operands: Vec<ValueId>,
    pub attrs: Vec<Attribute>,
    /// 1-based line in the text the op was parsed from, for diagnostics.
    pub line: Option<usize>,
}

impl GraphOp {
    pub fn new(op_type: impl Into<String>, results: Vec<ValueId>, operands: Vec<ValueId>) -> Self {
        Self {
            op_type: op_type.into(),
            results,
            operands,
            attrs: Vec::new(),
            line: None,
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.push_attr(Attribute::new(name, value));
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.push_attr(Attribute::device(placement));
        self
    }

    pub fn push_attr(&mut self, attr: Attribute) {
        self.attrs.push(attr);
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| &attr.value)
    }

    /// Number of device annotations; anything above one is malformed.
    pub fn device_attr_count(&self) -> usize {
        self.attrs.iter().filter(|a| a.name == DEVICE_ATTR).count()
    }

    /// Raw text of the first device annotation, if any.
    pub fn device_attr(&self) -> Option<&str> {
        match self.attr(DEVICE_ATTR)? {
            AttrValue::Str(raw) => Some(raw.as_str()),
            _ => None,
        }
    }

    /// Resolved placement, `Ok(None)` for unplaced ops.
    pub fn placement(&self) -> Result<Option<Placement>, DeviceError> {
        self.device_attr().map(Placement::from_identifier).transpose()
    }

    pub fn shape_array(&self) -> Option<&ShapeArray> {
        self.attrs
            .iter()
            .filter(|attr| is_shape_array_pseudo_attr(&attr.name, &attr.value))
            .find_map(|attr| match &attr.value {
                AttrValue::ShapeArray(shapes) => Some(shapes),
                _ => None,
            })
    }

    /// Copy of this op without its placement annotation.
    pub fn without_device_attr(&self) -> GraphOp {
        let mut copy = self.clone();
        copy.attrs.retain(|attr| attr.name != DEVICE_ATTR);
        copy
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Op(GraphOp),
    /// Ship `value` to the `dest` device.
    Send {
        value: ValueId,
        transfer: TransferId,
        dest: DeviceKind,
        shapes: Option<ShapeArray>,
    },
    /// Materialize a value shipped from the `src` device.
    Recv {
        dst: ValueId,
        transfer: TransferId,
        src: DeviceKind,
        shapes: Option<ShapeArray>,
    },
    Output(ValueId),
}

impl Instr {
    pub fn is_transfer(&self) -> bool {
        matches!(self, Instr::Send { .. } | Instr::Recv { .. })
    }
}

/// Values defined by `instr`.
pub fn instruction_defs(instr: &Instr) -> &[ValueId] {
    match instr {
        Instr::Op(op) => &op.results,
        Instr::Recv { dst, .. } => std::slice::from_ref(dst),
        Instr::Send { .. } | Instr::Output(_) => &[],
    }
}

/// Values read by `instr`.
pub fn instruction_operands(instr: &Instr) -> &[ValueId] {
    match instr {
        Instr::Op(op) => &op.operands,
        Instr::Send { value, .. } => std::slice::from_ref(value),
        Instr::Output(value) => std::slice::from_ref(value),
        Instr::Recv { .. } => &[],
    }
}

/// A named dataflow graph in program (topological) order.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub name: String,
    pub instrs: Vec<Instr>,
    pub next_id: usize,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instrs: Vec::new(),
            next_id: 0,
        }
    }

    pub fn fresh(&mut self) -> ValueId {
        let id = self.next_id;
        self.next_id += 1;
        ValueId(id)
    }

    /// Append `op_type` reading `operands`, defining one fresh result.
    pub fn push_op(
        &mut self,
        op_type: &str,
        operands: &[ValueId],
        attrs: Vec<Attribute>,
    ) -> ValueId {
        let dst = self.fresh();
        let mut op = GraphOp::new(op_type, vec![dst], operands.to_vec());
        op.attrs = attrs;
        self.instrs.push(Instr::Op(op));
        dst
    }

    pub fn push_output(&mut self, value: ValueId) {
        self.instrs.push(Instr::Output(value));
    }

    pub fn ops(&self) -> impl Iterator<Item = &GraphOp> + '_ {
        self.instrs.iter().filter_map(|instr| match instr {
            Instr::Op(op) => Some(op),
            _ => None,
        })
    }

    pub fn ops_mut(&mut self) -> impl Iterator<Item = &mut GraphOp> + '_ {
        self.instrs.iter_mut().filter_map(|instr| match instr {
            Instr::Op(op) => Some(op),
            _ => None,
        })
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&emit_graph(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShapeDim;

    #[test]
    fn shape_array_predicate_requires_key_and_value() {
        let shapes = AttrValue::ShapeArray(vec![vec![ShapeDim::Known(2)]]);
        assert!(is_shape_array_pseudo_attr(SHAPE_ARRAY_ATTR, &shapes));
        assert!(!is_shape_array_pseudo_attr("shapes", &shapes));
        assert!(!is_shape_array_pseudo_attr(
            SHAPE_ARRAY_ATTR,
            &AttrValue::Shape(vec![ShapeDim::Known(2)])
        ));
    }

    #[test]
    fn placement_reads_device_attr() {
        let op = GraphOp::new("Const", vec![ValueId(0)], vec![])
            .with_placement(Placement::Device(DeviceKind::Gpu));
        assert_eq!(op.placement(), Ok(Some(Placement::Device(DeviceKind::Gpu))));
        assert_eq!(op.without_device_attr().placement(), Ok(None));

        let bad = GraphOp::new("Const", vec![ValueId(0)], vec![])
            .with_attr(DEVICE_ATTR, AttrValue::Str("/device:XLA:0".to_string()));
        assert!(bad.placement().is_err());
    }

    #[test]
    fn defs_and_operands_cover_transfers() {
        let send = Instr::Send {
            value: ValueId(3),
            transfer: TransferId(1),
            dest: DeviceKind::Gpu,
            shapes: None,
        };
        assert!(instruction_defs(&send).is_empty());
        assert_eq!(instruction_operands(&send), &[ValueId(3)]);

        let recv = Instr::Recv {
            dst: ValueId(9),
            transfer: TransferId(1),
            src: DeviceKind::Cpu,
            shapes: None,
        };
        assert_eq!(instruction_defs(&recv), &[ValueId(9)]);
        assert!(instruction_operands(&recv).is_empty());
    }
}
