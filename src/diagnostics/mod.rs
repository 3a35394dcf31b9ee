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

//! Compiler diagnostics: structured records plus human, short, and JSON
//! renderers.

use std::io::{self, IsTerminal, Write};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
        }
    }
}

/// Location of a diagnostic. Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Span {
    pub file: Option<String>,
    pub line: usize,
    pub column: usize,
    pub length: usize,
}

impl Span {
    /// Span covering the start of `line`.
    pub fn line(line: usize, length: usize) -> Self {
        Self {
            file: None,
            line,
            column: 1,
            length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// Pass that produced the diagnostic (`parse`, `placement`, ...).
    pub phase: &'static str,
    pub code: &'static str,
    pub severity: Severity,
    pub message: String,
    pub span: Option<Span>,
    pub notes: Vec<String>,
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn error(phase: &'static str, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            phase,
            code,
            severity: Severity::Error,
            message: message.into(),
            span: None,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn with_span(mut self, span: Option<Span>) -> Self {
        self.span = span;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Attach `file` to the span, if there is one.
    pub fn in_file(mut self, file: Option<&str>) -> Self {
        if let (Some(span), Some(file)) = (self.span.as_mut(), file) {
            span.file = Some(file.to_string());
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticFormat {
    Human,
    Short,
    Json,
}

impl DiagnosticFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "human" => Some(DiagnosticFormat::Human),
            "short" => Some(DiagnosticFormat::Short),
            "json" => Some(DiagnosticFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "auto" => Some(ColorChoice::Auto),
            "always" => Some(ColorChoice::Always),
            "never" => Some(ColorChoice::Never),
            _ => None,
        }
    }
}

pub struct DiagnosticEmitter {
    format: DiagnosticFormat,
    color: bool,
}

impl DiagnosticEmitter {
    pub fn new(format: DiagnosticFormat, color: ColorChoice) -> Self {
        let color = match color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => io::stderr().is_terminal(),
        };
        Self { format, color }
    }

    /// Multi-line rendering with a source excerpt when `source` is given.
    pub fn render_human(&self, diag: &Diagnostic, source: Option<&str>) -> String {
        let mut out = format!(
            "{}[{}][{}]: {}\n",
            self.paint_severity(diag.severity),
            diag.phase,
            diag.code,
            diag.message
        );

        if let Some(span) = &diag.span {
            out.push_str(&format!(" --> {}\n", location(span)));
            let line_text = source.and_then(|src| src.lines().nth(span.line.saturating_sub(1)));
            if let Some(text) = line_text {
                let gutter = span.line.to_string();
                let pad = " ".repeat(gutter.len());
                let carets = "^".repeat(span.length.max(1));
                let indent = " ".repeat(span.column.saturating_sub(1));
                out.push_str(&format!("{pad} |\n{gutter} | {text}\n{pad} | {indent}{carets}\n"));
            }
        }

        for note in &diag.notes {
            out.push_str(&format!("  = note: {note}\n"));
        }
        if let Some(help) = &diag.help {
            out.push_str(&format!("  = help: {help}\n"));
        }
        out
    }

    /// Single-line rendering: `file:line:col: error[phase][code]: message`.
    pub fn render_short(&self, diag: &Diagnostic) -> String {
        let prefix = diag
            .span
            .as_ref()
            .map(|span| format!("{}: ", location(span)))
            .unwrap_or_default();
        format!(
            "{prefix}{}[{}][{}]: {}",
            self.paint_severity(diag.severity),
            diag.phase,
            diag.code,
            diag.message
        )
    }

    pub fn render_json(&self, diag: &Diagnostic) -> String {
        serde_json::to_string(diag).unwrap_or_else(|err| {
            format!(r#"{{"severity":"error","message":"unserializable diagnostic: {err}"}}"#)
        })
    }

    pub fn emit<W: Write>(&self, diag: &Diagnostic, source: Option<&str>, out: &mut W) {
        let rendered = match self.format {
            DiagnosticFormat::Human => self.render_human(diag, source),
            DiagnosticFormat::Short => self.render_short(diag),
            DiagnosticFormat::Json => self.render_json(diag),
        };
        // Diagnostics are best effort once the output stream is gone.
        let _ = writeln!(out, "{}", rendered.trim_end());
    }

    /// Emit every diagnostic to stderr.
    pub fn emit_all(&self, diags: &[Diagnostic], source: Option<&str>) {
        let stderr = io::stderr();
        let mut handle = stderr.lock();
        for diag in diags {
            self.emit(diag, source, &mut handle);
        }
    }

    fn paint_severity(&self, severity: Severity) -> String {
        if !self.color {
            return severity.as_str().to_string();
        }
        let code = match severity {
            Severity::Error => "31",
            Severity::Warning => "33",
            Severity::Note => "36",
        };
        format!("\x1b[1;{code}m{}\x1b[0m", severity.as_str())
    }
}

fn location(span: &Span) -> String {
    format!(
        "{}:{}:{}",
        span.file.as_deref().unwrap_or("<input>"),
        span.line,
        span.column
    )
}
