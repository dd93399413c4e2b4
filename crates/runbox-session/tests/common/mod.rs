#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use runbox_core::{
    ExecutionRequest, ExecutionResponse, FallbackExecutor, SessionId, SessionStatus, SessionStorage,
    Terminal,
    traits::{ExecuteError, Session, SessionFilter, StorageError, TerminalStyle},
};
use runbox_session::{OrchestratorOptions, SessionOrchestrator, storage::MemoryStorage};
use runbox_transport::{MemoryBroker, StreamTransport};
use serde_json::Value;
use tokio::sync::watch;

pub const RECONNECT: Duration = Duration::from_secs(3);

pub const PRINT_ONE: [&str; 2] = [
    r#"{"type":"stdout","data":"1\n"}"#,
    r#"{"type":"exit","exitCode":0,"executionTimeMs":8}"#,
];

/// Answer every execute command with `frames` on the session's topic.
pub fn script(broker: &MemoryBroker, frames: &[&'static str]) {
    let frames = frames.to_vec();
    broker.respond_with(move |destination, body| {
        if destination != "/app/execute" {
            return vec![];
        }
        let command: Value = serde_json::from_str(body).unwrap();
        let topic = format!(
            "/topic/execution/{}/output",
            command["sessionId"].as_str().unwrap()
        );
        frames
            .iter()
            .map(|frame| (topic.clone(), (*frame).to_string()))
            .collect()
    });
}

/// Fallback that records what it was asked to run.
#[derive(Default)]
pub struct RecordingFallback {
    pub response: Option<ExecutionResponse>,
    pub calls: Mutex<Vec<ExecutionRequest>>,
}

impl RecordingFallback {
    pub fn answering(response: ExecutionResponse) -> Arc<Self> {
        Arc::new(Self {
            response: Some(response),
            calls: Mutex::default(),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FallbackExecutor for RecordingFallback {
    async fn execute_once(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResponse, ExecuteError> {
        self.calls.lock().unwrap().push(request.clone());
        self.response
            .clone()
            .ok_or_else(|| ExecuteError::Request("connection refused".to_string()))
    }
}

/// Terminal that keeps everything written to it.
#[derive(Default)]
pub struct RecordingTerminal {
    pub writes: Mutex<Vec<(String, Option<TerminalStyle>)>>,
    pub resets: Mutex<usize>,
}

impl RecordingTerminal {
    pub fn text(&self) -> String {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|(text, _)| text.as_str())
            .collect()
    }

    pub fn styled(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, style)| *style == Some(TerminalStyle::Error))
            .map(|(text, _)| text.clone())
            .collect()
    }

    pub fn resets(&self) -> usize {
        *self.resets.lock().unwrap()
    }
}

impl Terminal for RecordingTerminal {
    fn write(&self, text: &str) {
        self.writes.lock().unwrap().push((text.to_string(), None));
    }

    fn write_styled(&self, text: &str, style: TerminalStyle) {
        self.writes
            .lock()
            .unwrap()
            .push((text.to_string(), Some(style)));
    }

    fn reset(&self) {
        self.writes.lock().unwrap().clear();
        *self.resets.lock().unwrap() += 1;
    }
}

/// Memory storage that logs status updates and can hold `create` until
/// released.
pub struct InstrumentedStorage {
    pub inner: MemoryStorage,
    pub statuses: Mutex<Vec<SessionStatus>>,
    pub creating: Mutex<usize>,
    open: watch::Sender<bool>,
}

impl InstrumentedStorage {
    pub fn open() -> Self {
        Self::with_gate(true)
    }

    /// `create` waits until [`release`](Self::release).
    pub fn gated() -> Self {
        Self::with_gate(false)
    }

    fn with_gate(open: bool) -> Self {
        Self {
            inner: MemoryStorage::new(),
            statuses: Mutex::default(),
            creating: Mutex::default(),
            open: watch::Sender::new(open),
        }
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn creating(&self) -> usize {
        *self.creating.lock().unwrap()
    }
}

#[async_trait]
impl SessionStorage for InstrumentedStorage {
    async fn create(&self, request: &ExecutionRequest) -> Result<Session, StorageError> {
        *self.creating.lock().unwrap() += 1;
        let mut open = self.open.subscribe();
        open.wait_for(|open| *open).await.unwrap();
        self.inner.create(request).await
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        self.inner.get(id).await
    }

    async fn update_status(&self, id: SessionId, status: SessionStatus) -> Result<(), StorageError> {
        self.statuses.lock().unwrap().push(status);
        self.inner.update_status(id, status).await
    }

    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, StorageError> {
        self.inner.list(filter).await
    }

    async fn remove(&self, id: SessionId) -> Result<(), StorageError> {
        self.inner.remove(id).await
    }
}

pub type TestOrchestrator = SessionOrchestrator<MemoryStorage, Arc<RecordingFallback>>;

pub fn streamed(
    broker: &MemoryBroker,
    fallback: Arc<RecordingFallback>,
    options: OrchestratorOptions,
) -> TestOrchestrator {
    let transport = StreamTransport::new(broker.clone(), RECONNECT);
    transport.activate();
    SessionOrchestrator::new(Some(transport), MemoryStorage::new(), fallback, options)
}

pub fn streamed_with<S: SessionStorage + 'static>(
    broker: &MemoryBroker,
    storage: S,
    fallback: Arc<RecordingFallback>,
) -> SessionOrchestrator<S, Arc<RecordingFallback>> {
    let transport = StreamTransport::new(broker.clone(), RECONNECT);
    transport.activate();
    SessionOrchestrator::new(Some(transport), storage, fallback, OrchestratorOptions::default())
}

pub async fn settle(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}
