//! Execution requests and synchronous responses.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::traits::SessionId;

/// Largest accepted source or stdin payload, in UTF-16 code units.
///
/// The server measures text the way Java strings do, so characters
/// outside the Basic Multilingual Plane count twice.
pub const MAX_PAYLOAD_UNITS: usize = 65_536;

fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Languages the execution engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
}

impl Language {
    /// All supported languages.
    pub const ALL: [Self; 2] = [Self::Python, Self::Javascript];

    /// Wire name of the language.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Javascript => "javascript",
        }
    }

    /// Guess a language from a file extension.
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "py" => Some(Self::Python),
            "js" | "mjs" | "cjs" => Some(Self::Javascript),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown language name.
#[derive(Debug, Error)]
#[error("Unsupported language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Self::Python),
            "javascript" | "js" | "node" => Ok(Self::Javascript),
            other => Err(UnknownLanguage(other.to_string())),
        }
    }
}

/// Request rejected before submission.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Code must not be blank")]
    BlankCode,
    #[error("Code is {0} characters long, limit is 65536")]
    CodeTooLarge(usize),
    #[error("Stdin is {0} characters long, limit is 65536")]
    StdinTooLarge(usize),
}

/// Source code to run. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

impl ExecutionRequest {
    /// Create a request without stdin.
    #[must_use]
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            stdin: None,
        }
    }

    /// Attach stdin.
    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Check the limits the server enforces.
    ///
    /// # Errors
    /// Returns the first limit the request breaks.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.code.trim().is_empty() {
            return Err(ValidationError::BlankCode);
        }
        let code_len = utf16_len(&self.code);
        if code_len > MAX_PAYLOAD_UNITS {
            return Err(ValidationError::CodeTooLarge(code_len));
        }
        match self.stdin.as_deref().map(utf16_len) {
            Some(stdin_len) if stdin_len > MAX_PAYLOAD_UNITS => {
                Err(ValidationError::StdinTooLarge(stdin_len))
            }
            _ => Ok(()),
        }
    }
}

/// Execute command published on the streaming transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommand {
    pub session_id: SessionId,
    pub code: String,
    pub language: Language,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

impl ExecuteCommand {
    /// Build the command for a session.
    #[must_use]
    pub fn new(session_id: SessionId, request: &ExecutionRequest) -> Self {
        Self {
            session_id,
            code: request.code.clone(),
            language: request.language,
            stdin: request.stdin.clone(),
        }
    }
}

/// Result of a synchronous execute call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u64,
}
