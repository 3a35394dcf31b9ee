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

//! Element types and shapes carried by graph attributes.
//!
//! # Example
//! ```
//! use devsplit::types::{DType, ShapeDim};
//! assert_eq!(DType::parse("f32"), Some(DType::F32));
//! assert_eq!(ShapeDim::Known(3).to_string(), "3");
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "bool" => Some(DType::Bool),
            "i32" => Some(DType::I32),
            "i64" => Some(DType::I64),
            "f16" => Some(DType::F16),
            "bf16" => Some(DType::BF16),
            "f32" => Some(DType::F32),
            "f64" => Some(DType::F64),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dimension of a tensor shape; symbolic dims keep their name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShapeDim {
    Known(usize),
    Sym(String),
}

impl fmt::Display for ShapeDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeDim::Known(n) => write!(f, "{n}"),
            ShapeDim::Sym(name) => f.write_str(name),
        }
    }
}

/// Render a shape as `[d0,d1,...]`.
pub fn format_shape(shape: &[ShapeDim]) -> String {
    let dims: Vec<String> = shape.iter().map(ToString::to_string).collect();
    format!("[{}]", dims.join(","))
}
