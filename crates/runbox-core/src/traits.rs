//! Core traits for storage, fallback execution and UI collaborators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{ExecutionRequest, ExecutionResponse, Language};

/// Session identifier.
pub type SessionId = Uuid;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, dispatch not yet on the wire. A session that falls back
    /// stays here until the fallback resolves.
    Pending,
    /// Subscribed and command published.
    Streaming,
    /// Exit frame received, streamed or from the fallback.
    Completed,
    /// Ended without an exit frame.
    Failed,
}

impl SessionStatus {
    /// Whether the session has reached a final status.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Session filter for queries.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Filter by status.
    pub status: Option<SessionStatus>,
    /// Filter by language.
    pub language: Option<Language>,
    /// Limit results.
    pub limit: Option<usize>,
}

/// One run and its output channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier, generated client-side.
    pub id: SessionId,
    /// The submitted request.
    pub request: ExecutionRequest,
    /// Current status.
    pub status: SessionStatus,
    /// Creation timestamp (Unix epoch milliseconds).
    pub started_at: i64,
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for session storage backends.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Create a new pending session.
    async fn create(&self, request: &ExecutionRequest) -> Result<Session, StorageError>;

    /// Get a session by ID.
    async fn get(&self, id: SessionId) -> Result<Option<Session>, StorageError>;

    /// Update session status.
    async fn update_status(&self, id: SessionId, status: SessionStatus) -> Result<(), StorageError>;

    /// List sessions with optional filter.
    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, StorageError>;

    /// Forget a finished session.
    async fn remove(&self, id: SessionId) -> Result<(), StorageError>;
}

/// Synchronous execute failure.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Invalid response: {0}")]
    Decode(String),
}

/// Trait for the synchronous request/response execute path.
#[async_trait]
pub trait FallbackExecutor: Send + Sync {
    /// Run the request once and wait for the whole result.
    async fn execute_once(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResponse, ExecuteError>;
}

#[async_trait]
impl<T: FallbackExecutor + ?Sized> FallbackExecutor for std::sync::Arc<T> {
    async fn execute_once(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResponse, ExecuteError> {
        (**self).execute_once(request).await
    }
}

/// Source of the code to run.
pub trait Editor: Send + Sync {
    /// Current buffer contents.
    fn current_code(&self) -> String;

    /// Language selected for the buffer.
    fn selected_language(&self) -> Language;
}

/// Visual style for terminal output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStyle {
    /// Marks stderr and error messages.
    Error,
}

/// Output surface for a run.
pub trait Terminal: Send + Sync {
    /// Write plain output.
    fn write(&self, text: &str);

    /// Write output with a style.
    fn write_styled(&self, text: &str, style: TerminalStyle);

    /// Clear previous output.
    fn reset(&self);
}
