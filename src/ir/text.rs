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

//! `dfg@1` text format for dataflow graphs.
//!
//! ```text
//! dfg@1 model
//! # comment
//! %0 = Const value=1.5 dtype=f32 __device="/device:CPU:0"
//! %1, %2 = Split %0 axis=0
//! %3 = MatMul %1, %2 __shapes=[[2,3],[3,4]]
//! %4 = recv transfer=7 src="/device:GPU:0"
//! send %3 transfer=7 dest="/device:GPU:0"
//! output %3
//! ```
//!
//! `send`, `recv` and `output` are reserved words. Everything else in
//! operation position is an opaque operation type.

use std::fmt::Write;

use logos::Logos;

use crate::device::DeviceKind;
use crate::ir::{
    AttrValue, Attribute, Graph, GraphOp, Instr, ShapeArray, TransferId, ValueId,
    SHAPE_ARRAY_ATTR,
};
use crate::types::{format_shape, DType, ShapeDim};

/// Format version header.
pub const TEXT_HEADER: &str = "dfg@1";

/// Maximum input size in bytes (10 MB).
pub const MAX_INPUT_SIZE: usize = 10 * 1024 * 1024;

/// Maximum number of instructions in one graph.
pub const MAX_INSTR_COUNT: usize = 100_000;

/// Maximum dimension count per shape.
pub const MAX_SHAPE_DIMS: usize = 32;

/// Largest value id accepted in `%<id>`.
pub const MAX_VALUE_ID: usize = i32::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dfg:{line}: error: {message}")]
pub struct ParseError {
    /// 1-based line, 0 for whole-input problems.
    pub line: usize,
    pub message: String,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+")]
enum Token {
    #[regex(r"%[0-9]+", value_id)]
    Value(usize),

    #[regex(
        r"-?[0-9]+\.[0-9]*([eE][-+]?[0-9]+)?|-?[0-9]+[eE][-+]?[0-9]+",
        |lex| lex.slice().parse::<f64>().ok()
    )]
    Float(f64),

    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r"[A-Za-z_][A-Za-z0-9_.]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| lex.slice().to_string())]
    Str(String),

    #[token("=")]
    Eq,
    #[token(",")]
    Comma,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
}

fn value_id(lex: &mut logos::Lexer<Token>) -> Option<usize> {
    lex.slice()[1..]
        .parse::<usize>()
        .ok()
        .filter(|&id| id <= MAX_VALUE_ID)
}

/// Parse a `dfg@1` document into a [`Graph`].
pub fn parse_graph(input: &str) -> Result<Graph, ParseError> {
    if input.len() > MAX_INPUT_SIZE {
        return Err(ParseError {
            line: 0,
            message: format!(
                "input too large: {} bytes (max {} bytes)",
                input.len(),
                MAX_INPUT_SIZE
            ),
        });
    }

    let mut lines = input
        .lines()
        .enumerate()
        .map(|(idx, raw)| (idx + 1, raw.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

    let (header_line, header) = lines.next().ok_or_else(|| ParseError {
        line: 0,
        message: format!("empty input, expected '{} <name>' header", TEXT_HEADER),
    })?;
    let mut graph = parse_header(header, header_line)?;
    let mut max_def = 0usize;

    for (line_no, line) in lines {
        if graph.instrs.len() >= MAX_INSTR_COUNT {
            return Err(ParseError {
                line: line_no,
                message: format!("too many instructions (max {})", MAX_INSTR_COUNT),
            });
        }

        let instr = LineParser::new(line, line_no)?.parse_instr()?;
        for def in crate::ir::instruction_defs(&instr) {
            max_def = max_def.max(def.0 + 1);
        }
        graph.instrs.push(instr);
    }

    graph.next_id = max_def;
    Ok(graph)
}

fn parse_header(line: &str, line_no: usize) -> Result<Graph, ParseError> {
    let (version, name) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    if version != TEXT_HEADER {
        let message = match version.strip_prefix("dfg@") {
            Some(v) => format!("unsupported version dfg@{v}, expected {TEXT_HEADER}"),
            None => format!("missing version header, expected '{TEXT_HEADER} <name>'"),
        };
        return Err(ParseError {
            line: line_no,
            message,
        });
    }
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(ParseError {
            line: line_no,
            message: "graph name must be a single word".to_string(),
        });
    }
    Ok(Graph::new(name))
}

struct LineParser {
    tokens: Vec<Token>,
    pos: usize,
    line: usize,
}

impl LineParser {
    fn new(text: &str, line: usize) -> Result<Self, ParseError> {
        let mut tokens = Vec::new();
        let mut lexer = Token::lexer(text);
        while let Some(token) = lexer.next() {
            match token {
                Ok(token) => tokens.push(token),
                Err(()) => {
                    let slice = lexer.slice();
                    let message = if slice.starts_with('%') {
                        format!("value id '{slice}' out of range (max %{MAX_VALUE_ID})")
                    } else {
                        format!("unexpected input '{slice}'")
                    };
                    return Err(ParseError { line, message });
                }
            }
        }
        Ok(Self {
            tokens,
            pos: 0,
            line,
        })
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            line: self.line,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ParseError> {
        match self.bump() {
            Some(token) if token == expected => Ok(()),
            Some(other) => Err(self.error(format!("expected {what}, found {other:?}"))),
            None => Err(self.error(format!("expected {what}, found end of line"))),
        }
    }

    fn expect_value(&mut self) -> Result<ValueId, ParseError> {
        match self.bump() {
            Some(Token::Value(id)) => Ok(ValueId(id)),
            Some(other) => Err(self.error(format!("expected value, found {other:?}"))),
            None => Err(self.error("expected value, found end of line")),
        }
    }

    fn expect_end(&self) -> Result<(), ParseError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(self.error(format!("unexpected trailing {token:?}"))),
        }
    }

    fn parse_instr(mut self) -> Result<Instr, ParseError> {
        match self.peek().cloned() {
            Some(Token::Ident(word)) if word == "output" => {
                self.bump();
                let value = self.expect_value()?;
                self.expect_end()?;
                Ok(Instr::Output(value))
            }
            Some(Token::Ident(word)) if word == "send" => {
                self.bump();
                let value = self.expect_value()?;
                let attrs = self.parse_attrs()?;
                let (transfer, dest, shapes) = self.transfer_fields(attrs, "dest")?;
                Ok(Instr::Send {
                    value,
                    transfer,
                    dest,
                    shapes,
                })
            }
            Some(Token::Ident(op_type)) => {
                self.bump();
                self.parse_op(op_type, Vec::new())
            }
            Some(Token::Value(_)) => {
                let results = self.parse_value_list()?;
                self.expect(Token::Eq, "'='")?;
                let op_type = match self.bump() {
                    Some(Token::Ident(name)) => name,
                    _ => return Err(self.error("expected operation type after '='")),
                };
                if op_type != "recv" {
                    return self.parse_op(op_type, results);
                }
                if results.len() != 1 {
                    return Err(self.error("recv defines exactly one value"));
                }
                let attrs = self.parse_attrs()?;
                let (transfer, src, shapes) = self.transfer_fields(attrs, "src")?;
                Ok(Instr::Recv {
                    dst: results[0],
                    transfer,
                    src,
                    shapes,
                })
            }
            _ => Err(self.error("expected an instruction")),
        }
    }

    fn parse_op(&mut self, op_type: String, results: Vec<ValueId>) -> Result<Instr, ParseError> {
        let operands = if matches!(self.peek(), Some(Token::Value(_))) {
            self.parse_value_list()?
        } else {
            Vec::new()
        };
        let attrs = self.parse_attrs()?;
        let mut op = GraphOp::new(op_type, results, operands);
        op.attrs = attrs;
        op.line = Some(self.line);
        Ok(Instr::Op(op))
    }

    fn parse_value_list(&mut self) -> Result<Vec<ValueId>, ParseError> {
        let mut values = vec![self.expect_value()?];
        while matches!(self.peek(), Some(Token::Comma)) {
            self.bump();
            values.push(self.expect_value()?);
        }
        Ok(values)
    }

    fn parse_attrs(&mut self) -> Result<Vec<Attribute>, ParseError> {
        let mut attrs = Vec::new();
        while self.peek().is_some() {
            let name = match (self.bump(), self.peek()) {
                (Some(Token::Ident(name)), Some(Token::Eq)) => name,
                _ => return Err(self.error("expected attribute 'name=value'")),
            };
            self.bump();
            let mut value = self.parse_attr_value()?;
            if name == SHAPE_ARRAY_ATTR && value == AttrValue::Shape(Vec::new()) {
                value = AttrValue::ShapeArray(Vec::new());
            }
            attrs.push(Attribute { name, value });
        }
        Ok(attrs)
    }

    fn parse_attr_value(&mut self) -> Result<AttrValue, ParseError> {
        match self.bump() {
            Some(Token::Int(v)) => Ok(AttrValue::Int(v)),
            Some(Token::Float(v)) => Ok(AttrValue::Float(v)),
            Some(Token::Str(raw)) => Ok(AttrValue::Str(self.unescape(&raw)?)),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(AttrValue::Bool(true)),
                "false" => Ok(AttrValue::Bool(false)),
                "NaN" => Ok(AttrValue::Float(f64::NAN)),
                "inf" => Ok(AttrValue::Float(f64::INFINITY)),
                other => DType::parse(other)
                    .map(AttrValue::Type)
                    .ok_or_else(|| self.error(format!("unknown attribute value '{other}'"))),
            },
            Some(Token::LBracket) => {
                if matches!(self.peek(), Some(Token::LBracket)) {
                    self.parse_shape_array()
                } else {
                    self.parse_shape_body().map(AttrValue::Shape)
                }
            }
            Some(other) => Err(self.error(format!("unexpected {other:?} in attribute value"))),
            None => Err(self.error("missing attribute value")),
        }
    }

    fn parse_shape_array(&mut self) -> Result<AttrValue, ParseError> {
        let mut shapes: ShapeArray = Vec::new();
        loop {
            self.expect(Token::LBracket, "'['")?;
            shapes.push(self.parse_shape_body()?);
            match self.bump() {
                Some(Token::Comma) => continue,
                Some(Token::RBracket) => break,
                _ => return Err(self.error("expected ',' or ']' in shape array")),
            }
        }
        Ok(AttrValue::ShapeArray(shapes))
    }

    /// Dims after an opening `[`, consuming the closing `]`.
    fn parse_shape_body(&mut self) -> Result<Vec<ShapeDim>, ParseError> {
        let mut dims = Vec::new();
        if matches!(self.peek(), Some(Token::RBracket)) {
            self.bump();
            return Ok(dims);
        }
        loop {
            let dim = match self.bump() {
                Some(Token::Int(n)) if n >= 0 => ShapeDim::Known(n as usize),
                Some(Token::Ident(sym)) => ShapeDim::Sym(sym),
                _ => return Err(self.error("expected shape dimension")),
            };
            dims.push(dim);
            if dims.len() > MAX_SHAPE_DIMS {
                return Err(self.error(format!(
                    "too many shape dimensions (max {})",
                    MAX_SHAPE_DIMS
                )));
            }
            match self.bump() {
                Some(Token::Comma) => continue,
                Some(Token::RBracket) => return Ok(dims),
                _ => return Err(self.error("expected ',' or ']' in shape")),
            }
        }
    }

    fn transfer_fields(
        &self,
        attrs: Vec<Attribute>,
        device_key: &str,
    ) -> Result<(TransferId, DeviceKind, Option<ShapeArray>), ParseError> {
        let mut transfer = None;
        let mut device = None;
        let mut shapes = None;
        for attr in attrs {
            match (attr.name.as_str(), attr.value) {
                ("transfer", AttrValue::Int(id)) if id >= 0 => {
                    transfer = Some(TransferId(id as u64))
                }
                (key, AttrValue::Str(raw)) if key == device_key => {
                    let kind = raw
                        .parse::<DeviceKind>()
                        .map_err(|err| self.error(err.to_string()))?;
                    device = Some(kind);
                }
                (SHAPE_ARRAY_ATTR, AttrValue::ShapeArray(array)) => shapes = Some(array),
                (key, _) => return Err(self.error(format!("unexpected transfer field '{key}'"))),
            }
        }
        let transfer = transfer.ok_or_else(|| self.error("transfer is missing 'transfer=<id>'"))?;
        let device = device
            .ok_or_else(|| self.error(format!("transfer is missing '{device_key}=<device>'")))?;
        Ok((transfer, device, shapes))
    }

    fn unescape(&self, quoted: &str) -> Result<String, ParseError> {
        let inner = &quoted[1..quoted.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(ch) = chars.next() {
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => return Err(self.error(format!("invalid escape '\\{other}'"))),
                None => return Err(self.error("dangling escape")),
            }
        }
        Ok(out)
    }
}

/// Render `graph` in canonical `dfg@1` form.
pub fn emit_graph(graph: &Graph) -> String {
    let mut out = String::new();
    writeln!(&mut out, "{} {}", TEXT_HEADER, graph.name).unwrap();
    for instr in &graph.instrs {
        emit_instr(instr, &mut out);
        out.push('\n');
    }
    out
}

fn emit_instr(instr: &Instr, out: &mut String) {
    match instr {
        Instr::Op(op) => {
            if !op.results.is_empty() {
                out.push_str(&join_values(&op.results));
                out.push_str(" = ");
            }
            out.push_str(&op.op_type);
            if !op.operands.is_empty() {
                out.push(' ');
                out.push_str(&join_values(&op.operands));
            }
            for attr in &op.attrs {
                write!(out, " {}={}", attr.name, format_attr_value(&attr.value)).unwrap();
            }
        }
        Instr::Send {
            value,
            transfer,
            dest,
            shapes,
        } => {
            write!(out, "send {value} transfer={transfer} dest=\"{dest}\"").unwrap();
            emit_shapes(shapes.as_ref(), out);
        }
        Instr::Recv {
            dst,
            transfer,
            src,
            shapes,
        } => {
            write!(out, "{dst} = recv transfer={transfer} src=\"{src}\"").unwrap();
            emit_shapes(shapes.as_ref(), out);
        }
        Instr::Output(value) => {
            write!(out, "output {value}").unwrap();
        }
    }
}

fn emit_shapes(shapes: Option<&ShapeArray>, out: &mut String) {
    if let Some(shapes) = shapes {
        write!(
            out,
            " {}={}",
            SHAPE_ARRAY_ATTR,
            format_attr_value(&AttrValue::ShapeArray(shapes.clone()))
        )
        .unwrap();
    }
}

fn join_values(values: &[ValueId]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_attr_value(value: &AttrValue) -> String {
    match value {
        AttrValue::Int(v) => v.to_string(),
        AttrValue::Float(v) => format!("{v:?}"),
        AttrValue::Bool(v) => v.to_string(),
        AttrValue::Str(s) => escape(s),
        AttrValue::Type(dtype) => dtype.to_string(),
        AttrValue::Shape(shape) => format_shape(shape),
        AttrValue::ShapeArray(shapes) => {
            let inner: Vec<String> = shapes.iter().map(|s| format_shape(s)).collect();
            format!("[{}]", inner.join(","))
        }
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for ch in raw.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Placement;

    #[test]
    fn parses_ops_transfers_and_outputs() {
        let src = r#"dfg@1 model
# leading comment
%0 = Const value=1.5 dtype=f32 __device="/device:CPU:0"
%1, %2 = Split %0 axis=0
%3 = MatMul %1, %2 __shapes=[[2,B],[3,4]]
send %3 transfer=7 dest="/device:GPU:0"
%4 = recv transfer=8 src="TPU_SYSTEM"
output %4
"#;
        let graph = parse_graph(src).expect("parse");
        assert_eq!(graph.name, "model");
        assert_eq!(graph.instrs.len(), 6);
        assert_eq!(graph.next_id, 5);

        let Instr::Op(konst) = &graph.instrs[0] else {
            panic!("expected op");
        };
        assert_eq!(konst.attr("value"), Some(&AttrValue::Float(1.5)));
        assert_eq!(konst.attr("dtype"), Some(&AttrValue::Type(DType::F32)));
        assert_eq!(konst.placement(), Ok(Some(Placement::Device(DeviceKind::Cpu))));
        assert_eq!(konst.line, Some(3));

        let Instr::Op(matmul) = &graph.instrs[2] else {
            panic!("expected op");
        };
        assert_eq!(matmul.operands, vec![ValueId(1), ValueId(2)]);
        assert_eq!(
            matmul.shape_array(),
            Some(&vec![
                vec![ShapeDim::Known(2), ShapeDim::Sym("B".to_string())],
                vec![ShapeDim::Known(3), ShapeDim::Known(4)],
            ])
        );

        assert_eq!(
            graph.instrs[3],
            Instr::Send {
                value: ValueId(3),
                transfer: TransferId(7),
                dest: DeviceKind::Gpu,
                shapes: None,
            }
        );
        assert!(matches!(
            graph.instrs[4],
            Instr::Recv { src: DeviceKind::Tpu, transfer: TransferId(8), .. }
        ));
        assert_eq!(graph.instrs[5], Instr::Output(ValueId(4)));
    }

    #[test]
    fn emit_is_stable_under_reparse() {
        let src = r#"dfg@1 g
%0 = Const value=-3 note="a \"quoted\"\tword" flag=true
%1 = Reshape %0 shape=[] __shapes=[[1],[]]
Print %1
output %1
"#;
        let first = emit_graph(&parse_graph(src).expect("parse"));
        let second = emit_graph(&parse_graph(&first).expect("reparse"));
        assert_eq!(first, second);
        assert!(first.contains("note=\"a \\\"quoted\\\"\\tword\""));
    }

    #[test]
    fn rejects_bad_headers() {
        assert_eq!(parse_graph("").unwrap_err().line, 0);
        let err = parse_graph("dfg@2 g\n").unwrap_err();
        assert!(err.message.contains("unsupported version"));
        let err = parse_graph("graph g\n").unwrap_err();
        assert!(err.message.contains("missing version header"));
        assert!(parse_graph("dfg@1\n").is_err());
    }

    #[test]
    fn transfers_require_concrete_devices() {
        let err = parse_graph("dfg@1 g\nsend %0 transfer=1 dest=\"ALL_DEVICES\"\n").unwrap_err();
        assert_eq!(err.line, 2);
        let err = parse_graph("dfg@1 g\n%0 = recv src=\"/device:CPU:0\"\n").unwrap_err();
        assert!(err.message.contains("transfer="));
    }

    #[test]
    fn rejects_oversized_shapes_and_input() {
        let dims = (0..40).map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        let src = format!("dfg@1 g\n%0 = Const shape=[{dims}]\n");
        assert!(parse_graph(&src).unwrap_err().message.contains("too many shape"));

        let huge = "dfg@1 g\n".to_string() + &"#".repeat(MAX_INPUT_SIZE);
        assert!(parse_graph(&huge).unwrap_err().message.contains("too large"));
    }

    #[test]
    fn reports_lexer_errors_with_line() {
        let err = parse_graph("dfg@1 g\n\n%0 = Const value=$\n").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.to_string().starts_with("dfg:3: error:"));
    }

    #[test]
    fn rejects_out_of_range_value_ids() {
        let err = parse_graph("dfg@1 g\n%18446744073709551615 = Const\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("out of range"));

        let err = parse_graph("dfg@1 g\n%0 = Const\n%1 = Neg %99999999999\n").unwrap_err();
        assert_eq!(err.line, 3);

        let src = format!("dfg@1 g\n%{MAX_VALUE_ID} = Const\n");
        let graph = parse_graph(&src).expect("largest id is accepted");
        assert_eq!(graph.next_id, MAX_VALUE_ID + 1);
    }
}
