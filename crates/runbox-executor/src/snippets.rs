//! Read access to shared snippets.

use runbox_core::{ExecutionRequest, Language, traits::ExecuteError};
use serde::{Deserialize, Serialize};

/// A saved piece of code published under a share id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    #[serde(default)]
    pub id: Option<i64>,
    pub title: String,
    /// Absent or `null` for a snippet saved without code.
    #[serde(default)]
    pub code: Option<String>,
    pub language: Language,
    #[serde(default)]
    pub share_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Snippet {
    /// Request that runs this snippet.
    #[must_use]
    pub fn to_request(&self) -> ExecutionRequest {
        ExecutionRequest::new(self.code.clone().unwrap_or_default(), self.language)
    }
}

/// Client for `GET /api/snippets/share/{shareId}`.
#[derive(Debug, Clone)]
pub struct SnippetClient {
    client: reqwest::Client,
    base_url: String,
}

impl SnippetClient {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Fetch a shared snippet. `Ok(None)` when the id is unknown.
    ///
    /// # Errors
    /// Returns error if the request fails or the body is not a snippet.
    pub async fn fetch_shared(&self, share_id: &str) -> Result<Option<Snippet>, ExecuteError> {
        let url = format!("{}/api/snippets/share/{share_id}", self.base_url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ExecuteError::Request(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecuteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Snippet>()
            .await
            .map(Some)
            .map_err(|e| ExecuteError::Decode(e.to_string()))
    }
}
