//! Output frames delivered on a session's output topic.

use serde::{Deserialize, Serialize};

/// Sentinel written when a synchronous run produced neither stdout nor stderr.
pub const NO_OUTPUT: &str = "(no output)";

/// One unit of output produced by a run.
///
/// `Exit` and `Error` are the only terminal-signal variants; `Stdout` and
/// `Stderr` may repeat any number of times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutputFrame {
    /// A chunk of standard output.
    Stdout { data: String },
    /// A chunk of standard error.
    Stderr { data: String },
    /// The program exited.
    Exit { exit_code: i32, execution_time_ms: u64 },
    /// The server reported a failure.
    Error { message: String },
}

/// A message body that is not a well-formed frame.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized output frame: {0}")]
pub struct FrameDecodeError(#[from] serde_json::Error);

impl OutputFrame {
    /// Create a stdout frame.
    #[must_use]
    pub fn stdout(data: impl Into<String>) -> Self {
        Self::Stdout { data: data.into() }
    }

    /// Create a stderr frame.
    #[must_use]
    pub fn stderr(data: impl Into<String>) -> Self {
        Self::Stderr { data: data.into() }
    }

    /// Create an exit frame.
    #[must_use]
    pub const fn exit(exit_code: i32, execution_time_ms: u64) -> Self {
        Self::Exit {
            exit_code,
            execution_time_ms,
        }
    }

    /// Create an error frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Decode a frame from a message body.
    ///
    /// # Errors
    /// Returns error if the body is not JSON or names an unknown variant.
    pub fn decode(body: &str) -> Result<Self, FrameDecodeError> {
        Ok(serde_json::from_str(body)?)
    }

    /// Decode a frame, turning anything unrecognized into a display-only
    /// `Error` frame so a bad message never aborts a session.
    #[must_use]
    pub fn decode_lossy(body: &str) -> Self {
        Self::decode(body).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "received malformed output frame");
            Self::error(e.to_string())
        })
    }

    /// Encode the frame as a JSON message body.
    #[must_use]
    pub fn encode(&self) -> String {
        // Serialization of this enum cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Whether this is an `Exit` frame.
    #[must_use]
    pub const fn is_exit(&self) -> bool {
        matches!(self, Self::Exit { .. })
    }

    /// Whether this frame signals the end of a run.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Exit { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_wire_format() {
        let json = OutputFrame::exit(0, 8).encode();
        assert_eq!(json, r#"{"type":"exit","exitCode":0,"executionTimeMs":8}"#);
    }

    #[test]
    fn test_decode_ignores_null_fields() {
        let body = r#"{"type":"stdout","data":"1\n","exitCode":null,"executionTimeMs":null,"message":null}"#;
        assert_eq!(OutputFrame::decode(body).unwrap(), OutputFrame::stdout("1\n"));
    }

    #[test]
    fn test_decode_error_frame() {
        let body = r#"{"type":"error","message":"Execution already in progress"}"#;
        let frame = OutputFrame::decode(body).unwrap();
        assert!(frame.is_terminal());
        assert!(!frame.is_exit());
    }

    #[test]
    fn test_unknown_variant_becomes_display_error() {
        let frame = OutputFrame::decode_lossy(r#"{"type":"progress","percent":50}"#);
        match frame {
            OutputFrame::Error { message } => assert!(message.contains("unrecognized output frame")),
            other => panic!("Wrong frame: {other:?}"),
        }
    }

    #[test]
    fn test_garbage_body_becomes_display_error() {
        assert!(matches!(
            OutputFrame::decode_lossy("not json"),
            OutputFrame::Error { .. }
        ));
    }
}
