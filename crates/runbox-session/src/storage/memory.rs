//! In-memory session storage.

use std::{
    collections::HashMap,
    sync::RwLock,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use runbox_core::{
    ExecutionRequest,
    traits::{Session, SessionFilter, SessionId, SessionStatus, SessionStorage, StorageError},
};
use uuid::Uuid;

/// In-memory storage implementation.
///
/// Holds only live sessions; finished ones are removed by the orchestrator.
#[derive(Debug)]
pub struct MemoryStorage {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().map_or(0, |s| s.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn create(&self, request: &ExecutionRequest) -> Result<Session, StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        // Ids must never collide with a live session.
        let mut id = Uuid::new_v4();
        while sessions.contains_key(&id) {
            id = Uuid::new_v4();
        }

        let session = Session {
            id,
            request: request.clone(),
            status: SessionStatus::Pending,
            started_at: now_ms(),
        };
        sessions.insert(id, session.clone());
        Ok(session)
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(&id)
            .cloned())
    }

    async fn update_status(&self, id: SessionId, status: SessionStatus) -> Result<(), StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let session = sessions.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        session.status = status;

        Ok(())
    }

    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, StorageError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut result: Vec<Session> = sessions
            .values()
            .filter(|s| filter.status.is_none_or(|status| s.status == status))
            .filter(|s| filter.language.is_none_or(|language| s.request.language == language))
            .cloned()
            .collect();

        // Newest first
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result)
    }

    async fn remove(&self, id: SessionId) -> Result<(), StorageError> {
        self.sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::NotFound(id))
    }
}
