//! Synchronous execution over the HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use runbox_core::{
    ExecutionRequest, ExecutionResponse, FallbackExecutor, OutputFrame,
    frame::NO_OUTPUT,
    traits::ExecuteError,
};
use tracing::{debug, warn};

/// Message shown when the synchronous call itself fails.
pub const FALLBACK_FAILURE_MESSAGE: &str = "Failed to execute code. Is the backend running?";

/// Calls `POST /api/execute` and waits for the full result.
#[derive(Debug, Clone)]
pub struct HttpFallback {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFallback {
    /// Create a client for the API at `base_url`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ExecuteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExecuteError::Request(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Reuse an existing HTTP client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Check `GET /api/health`.
    ///
    /// # Errors
    /// Returns error if the backend is unreachable or unhealthy.
    pub async fn health(&self) -> Result<(), ExecuteError> {
        let response = self
            .client
            .get(self.url("/api/health"))
            .send()
            .await
            .map_err(|e| ExecuteError::Request(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ExecuteError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl FallbackExecutor for HttpFallback {
    async fn execute_once(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResponse, ExecuteError> {
        debug!(language = %request.language, "executing over HTTP");
        let response = self
            .client
            .post(self.url("/api/execute"))
            .json(request)
            .send()
            .await
            .map_err(|e| ExecuteError::Request(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecuteError::RateLimited(rate_limit_reason(&body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecuteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<ExecutionResponse>()
            .await
            .map_err(|e| ExecuteError::Decode(e.to_string()))
    }
}

fn rate_limit_reason(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

/// Frames the streaming path would have produced for a synchronous result.
#[must_use]
pub fn response_frames(response: ExecutionResponse) -> Vec<OutputFrame> {
    let ExecutionResponse {
        stdout,
        stderr,
        exit_code,
        execution_time_ms,
    } = response;

    let mut frames = Vec::with_capacity(3);
    if !stdout.is_empty() {
        frames.push(OutputFrame::stdout(stdout));
    }
    if !stderr.is_empty() {
        frames.push(OutputFrame::stderr(stderr));
    }
    if frames.is_empty() {
        frames.push(OutputFrame::stdout(NO_OUTPUT));
    }
    frames.push(OutputFrame::exit(exit_code, execution_time_ms));
    frames
}

/// Translate a synchronous call outcome into frames.
///
/// A failed call becomes a single `Error` frame with no `Exit`.
#[must_use]
pub fn fallback_frames(result: Result<ExecutionResponse, ExecuteError>) -> Vec<OutputFrame> {
    match result {
        Ok(response) => response_frames(response),
        Err(e) => {
            warn!(error = %e, "synchronous execution failed");
            vec![OutputFrame::error(FALLBACK_FAILURE_MESSAGE)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdout_only() {
        let frames = response_frames(ExecutionResponse {
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            execution_time_ms: 12,
        });
        assert_eq!(frames, vec![OutputFrame::stdout("hi\n"), OutputFrame::exit(0, 12)]);
    }

    #[test]
    fn test_empty_output_sentinel() {
        let frames = response_frames(ExecutionResponse {
            execution_time_ms: 5,
            ..ExecutionResponse::default()
        });
        assert_eq!(
            frames,
            vec![OutputFrame::stdout("(no output)"), OutputFrame::exit(0, 5)]
        );
    }

    #[test]
    fn test_stdout_then_stderr() {
        let frames = response_frames(ExecutionResponse {
            stdout: "a".to_string(),
            stderr: "Traceback".to_string(),
            exit_code: 1,
            execution_time_ms: 30,
        });
        assert_eq!(
            frames,
            vec![
                OutputFrame::stdout("a"),
                OutputFrame::stderr("Traceback"),
                OutputFrame::exit(1, 30)
            ]
        );
    }

    #[test]
    fn test_call_failure_has_no_exit() {
        let frames = fallback_frames(Err(ExecuteError::Request("connection refused".into())));
        assert_eq!(frames, vec![OutputFrame::error(FALLBACK_FAILURE_MESSAGE)]);
    }

    #[test]
    fn test_rate_limit_reason() {
        assert_eq!(
            rate_limit_reason(r#"{"error":"Rate limit exceeded. Max 10 requests per minute."}"#),
            "Rate limit exceeded. Max 10 requests per minute."
        );
        assert_eq!(rate_limit_reason("slow down"), "slow down");
    }
}
