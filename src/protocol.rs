use crate::error::EncodingError;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Payload sent when a result cannot be encoded, and for builds without diagnostics
const EMPTY_RESULT: &[u8] = br#"{"messages":[]}"#;

/// Severity reported by the compiler for a single diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// One compiler-reported item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticMessage {
    #[serde(rename = "type")]
    pub severity: Severity,
    #[serde(rename = "message")]
    pub text: String,
    /// Path of the offending file, empty when the compiler did not name one
    #[serde(rename = "file")]
    pub source_file: String,
    pub line: u32,
    pub column: u32,
}

impl DiagnosticMessage {
    pub fn new(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
            source_file: String::new(),
            line: 0,
            column: 0,
        }
    }

    pub fn at(mut self, source_file: impl Into<String>, line: u32, column: u32) -> Self {
        self.source_file = source_file.into();
        self.line = line;
        self.column = column;
        self
    }
}

/// Response to one build request, in the order the compiler reported
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub messages: Vec<DiagnosticMessage>,
}

impl BuildResult {
    pub fn new(messages: Vec<DiagnosticMessage>) -> Self {
        Self { messages }
    }

    pub fn error_count(&self) -> usize {
        self.count(Severity::Error)
    }

    pub fn warning_count(&self) -> usize {
        self.count(Severity::Warning)
    }

    fn count(&self, severity: Severity) -> usize {
        self.messages
            .iter()
            .filter(|m| m.severity == severity)
            .count()
    }
}

/// Encode a build result as a compact JSON object (without the trailing newline)
pub fn encode(result: &BuildResult) -> Result<Vec<u8>, EncodingError> {
    Ok(serde_json::to_vec(result)?)
}

/// Encode a build result, falling back to an empty report if encoding fails
pub fn encode_or_empty(result: &BuildResult) -> Vec<u8> {
    match encode(result) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "failed to encode diagnostics; sending an empty report");
            EMPTY_RESULT.to_vec()
        }
    }
}
