//! Session orchestrator: one streamed execution per request, with a
//! synchronous fallback when the stream path cannot be used.

use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::Stream;
use runbox_core::{
    ClientConfig, ExecuteCommand, ExecutionRequest, FallbackExecutor, OutputFrame,
    request::ValidationError,
    traits::{Session, SessionFilter, SessionId, SessionStatus, SessionStorage, StorageError},
};
use runbox_executor::fallback_frames;
use runbox_transport::{StreamTransport, Subscription, TransportError};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::Instant,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Orchestrator error.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Routing and timing for streamed sessions.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Where execute commands are published.
    pub command_destination: String,
    /// Per-session topics are `{topic_prefix}/{id}/output`.
    pub topic_prefix: String,
    /// Give up on a dispatch still queued after this long and fall back.
    pub queue_timeout: Option<Duration>,
    /// Treat an `Error` frame as the end of the session.
    pub error_terminates: bool,
}

impl OrchestratorOptions {
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            command_destination: config.command_destination.clone(),
            topic_prefix: config.topic_prefix.trim_end_matches('/').to_string(),
            queue_timeout: config.queue_timeout(),
            error_terminates: config.error_terminates,
        }
    }

    /// Output topic of a session.
    #[must_use]
    pub fn topic_for(&self, session_id: SessionId) -> String {
        format!("{}/{session_id}/output", self.topic_prefix)
    }
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// Output of one session, in arrival order.
///
/// Ends after the terminal frame, or when the session cannot continue.
/// Dropping it abandons the session and releases its subscription.
#[derive(Debug)]
pub struct FrameStream {
    session_id: SessionId,
    inner: UnboundedReceiverStream<OutputFrame>,
}

impl FrameStream {
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl Stream for FrameStream {
    type Item = OutputFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Runs requests as streamed sessions.
pub struct SessionOrchestrator<S, F>
where
    S: SessionStorage,
    F: FallbackExecutor,
{
    transport: Option<StreamTransport>,
    storage: Arc<S>,
    fallback: Arc<F>,
    options: OrchestratorOptions,
}

impl<S, F> SessionOrchestrator<S, F>
where
    S: SessionStorage + 'static,
    F: FallbackExecutor + 'static,
{
    /// Create an orchestrator. Without a transport every request goes
    /// straight to `fallback`.
    #[must_use]
    pub fn new(
        transport: Option<StreamTransport>,
        storage: S,
        fallback: F,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            transport,
            storage: Arc::new(storage),
            fallback: Arc::new(fallback),
            options,
        }
    }

    #[must_use]
    pub const fn transport(&self) -> Option<&StreamTransport> {
        self.transport.as_ref()
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    #[must_use]
    pub const fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Sessions that have not finished yet.
    ///
    /// # Errors
    /// Returns error if storage fails.
    pub async fn active_sessions(&self) -> Result<Vec<Session>, StorageError> {
        self.storage.list(SessionFilter::default()).await
    }

    /// Start a session for `request` and return its output.
    ///
    /// The subscription to the session topic is always issued before the
    /// command is published. If the command cannot be dispatched the same
    /// request is run once over the fallback and its result is emitted as
    /// frames on the same stream.
    ///
    /// # Errors
    /// Returns error if the request is invalid or the session cannot be
    /// created.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<FrameStream, OrchestratorError> {
        request.validate()?;
        let session = self.storage.create(&request).await?;
        let session_id = session.id;
        info!(
            session_id = %session_id,
            language = %request.language,
            streamed = self.transport.is_some(),
            "starting session"
        );

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let run = SessionRun {
            id: session_id,
            request,
            storage: Arc::clone(&self.storage),
            fallback: Arc::clone(&self.fallback),
            frames: frames_tx,
            recorded: SessionStatus::Pending,
        };

        match &self.transport {
            Some(transport) => {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let command = serde_json::to_string(&ExecuteCommand::new(session_id, &run.request))?;
                let claim = Arc::new(DispatchClaim::default());
                self.dispatch(transport, session_id, command, events_tx, Arc::clone(&claim));
                tokio::spawn(run.stream(
                    events_rx,
                    claim,
                    self.options.queue_timeout,
                    self.options.error_terminates,
                ));
            }
            None => {
                tokio::spawn(run.fall_back(None));
            }
        }

        Ok(FrameStream {
            session_id,
            inner: UnboundedReceiverStream::new(frames_rx),
        })
    }

    fn dispatch(
        &self,
        transport: &StreamTransport,
        session_id: SessionId,
        command: String,
        events: UnboundedSender<SessionEvent>,
        claim: Arc<DispatchClaim>,
    ) {
        let topic = self.options.topic_for(session_id);
        let destination = self.options.command_destination.clone();

        transport.run_when_connected(move |channel| {
            if events.is_closed() || !claim.take() {
                debug!(session_id = %session_id, "session gone before dispatch, skipping");
                return;
            }
            let on_message = {
                let events = events.clone();
                move |body: String| {
                    let _ = events.send(SessionEvent::Message(body));
                }
            };
            let outcome = channel.subscribe(&topic, on_message).and_then(|subscription| {
                // A failed publish drops the subscription, which releases it.
                channel.publish(&destination, command)?;
                Ok(subscription)
            });
            let _ = events.send(match outcome {
                Ok(subscription) => SessionEvent::Dispatched(subscription),
                Err(e) => SessionEvent::DispatchFailed(e),
            });
        });
    }
}

/// Settles the race between a queued dispatch and the queue timeout.
/// Only the first to take it goes ahead.
#[derive(Debug, Default)]
struct DispatchClaim(AtomicBool);

impl DispatchClaim {
    fn take(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

enum SessionEvent {
    Dispatched(Subscription),
    DispatchFailed(TransportError),
    Message(String),
}

enum Next {
    Event(SessionEvent),
    TimedOut,
    Closed,
}

enum Outcome {
    Continue,
    Finished,
    FallBack(TransportError),
}

/// Status bookkeeping for a streamed session.
struct SessionMachine {
    status: SessionStatus,
    subscription: Option<Subscription>,
    error_terminates: bool,
}

impl SessionMachine {
    const fn new(error_terminates: bool) -> Self {
        Self {
            status: SessionStatus::Pending,
            subscription: None,
            error_terminates,
        }
    }

    fn on_event(&mut self, event: SessionEvent, frames: &UnboundedSender<OutputFrame>) -> Outcome {
        match event {
            SessionEvent::Dispatched(subscription) => {
                if self.status == SessionStatus::Pending {
                    self.status = SessionStatus::Streaming;
                }
                self.subscription = Some(subscription);
                Outcome::Continue
            }
            SessionEvent::DispatchFailed(e) => Outcome::FallBack(e),
            SessionEvent::Message(body) => {
                // Output can overtake the dispatch acknowledgement.
                if self.status == SessionStatus::Pending {
                    self.status = SessionStatus::Streaming;
                }
                let frame = OutputFrame::decode_lossy(&body);
                let finished = match &frame {
                    OutputFrame::Exit { .. } => Some(SessionStatus::Completed),
                    OutputFrame::Error { .. } if self.error_terminates => Some(SessionStatus::Failed),
                    OutputFrame::Error { .. } | OutputFrame::Stdout { .. } | OutputFrame::Stderr { .. } => {
                        None
                    }
                };
                let _ = frames.send(frame);
                match finished {
                    Some(status) => {
                        self.status = status;
                        self.release();
                        Outcome::Finished
                    }
                    None => Outcome::Continue,
                }
            }
        }
    }

    fn release(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }
}

async fn next_event(events: &mut UnboundedReceiver<SessionEvent>, deadline: Option<Instant>) -> Next {
    let event = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(event) => event,
            Err(_) => return Next::TimedOut,
        },
        None => events.recv().await,
    };
    event.map_or(Next::Closed, Next::Event)
}

/// Drives one session from dispatch to its end.
struct SessionRun<S, F> {
    id: SessionId,
    request: ExecutionRequest,
    storage: Arc<S>,
    fallback: Arc<F>,
    frames: UnboundedSender<OutputFrame>,
    recorded: SessionStatus,
}

impl<S, F> SessionRun<S, F>
where
    S: SessionStorage,
    F: FallbackExecutor,
{
    async fn stream(
        mut self,
        mut events: UnboundedReceiver<SessionEvent>,
        claim: Arc<DispatchClaim>,
        queue_timeout: Option<Duration>,
        error_terminates: bool,
    ) {
        let mut machine = SessionMachine::new(error_terminates);
        let mut deadline = queue_timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let pending_deadline = deadline.filter(|_| machine.status == SessionStatus::Pending);
            let next = tokio::select! {
                next = next_event(&mut events, pending_deadline) => next,
                () = self.frames.closed() => {
                    debug!(session_id = %self.id, "output dropped, abandoning session");
                    break;
                }
            };

            let outcome = match next {
                Next::Event(event) => machine.on_event(event, &self.frames),
                Next::TimedOut if claim.take() => {
                    Outcome::FallBack(TransportError::QueueTimeout(queue_timeout.unwrap_or_default()))
                }
                Next::TimedOut => {
                    debug!(session_id = %self.id, "dispatch already running, waiting for it");
                    deadline = None;
                    Outcome::Continue
                }
                Next::Closed if machine.status == SessionStatus::Pending => {
                    Outcome::FallBack(TransportError::Deactivated)
                }
                Next::Closed => {
                    warn!(session_id = %self.id, "subscription released before exit");
                    machine.status = SessionStatus::Failed;
                    Outcome::Finished
                }
            };
            // A fallback records its own final status.
            if !matches!(outcome, Outcome::FallBack(_)) {
                self.record(machine.status).await;
            }

            match outcome {
                Outcome::Continue => {}
                Outcome::Finished => break,
                Outcome::FallBack(e) => {
                    // Closing the channel turns a still-queued dispatch into a no-op.
                    drop(events);
                    machine.release();
                    self.fall_back(Some(e)).await;
                    return;
                }
            }
        }

        machine.release();
        self.finish().await;
    }

    async fn fall_back(mut self, reason: Option<TransportError>) {
        match &reason {
            Some(e) => warn!(
                session_id = %self.id,
                error = %e,
                "stream dispatch failed, executing synchronously"
            ),
            None => debug!(session_id = %self.id, "no stream transport, executing synchronously"),
        }

        let result = tokio::select! {
            result = self.fallback.execute_once(&self.request) => Some(result),
            () = self.frames.closed() => None,
        };
        let Some(result) = result else {
            debug!(session_id = %self.id, "output dropped during synchronous execution");
            self.finish().await;
            return;
        };

        let frames = fallback_frames(result);
        let status = if frames.iter().any(OutputFrame::is_exit) {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        for frame in frames {
            if self.frames.send(frame).is_err() {
                break;
            }
        }
        self.record(status).await;
        self.finish().await;
    }

    async fn record(&mut self, status: SessionStatus) {
        if status == self.recorded {
            return;
        }
        debug!(session_id = %self.id, from = ?self.recorded, to = ?status, "session status changed");
        self.recorded = status;
        if let Err(e) = self.storage.update_status(self.id, status).await {
            warn!(session_id = %self.id, error = %e, "failed to record session status");
        }
    }

    async fn finish(self) {
        info!(session_id = %self.id, status = ?self.recorded, "session finished");
        if let Err(e) = self.storage.remove(self.id).await {
            warn!(session_id = %self.id, error = %e, "failed to remove session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_with_frames(
        error_terminates: bool,
    ) -> (
        SessionMachine,
        UnboundedSender<OutputFrame>,
        UnboundedReceiver<OutputFrame>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionMachine::new(error_terminates), tx, rx)
    }

    #[test]
    fn test_exit_completes() {
        let (mut machine, tx, mut rx) = machine_with_frames(false);

        let outcome = machine.on_event(SessionEvent::Message(r#"{"type":"stdout","data":"1\n"}"#.into()), &tx);
        assert!(matches!(outcome, Outcome::Continue));
        assert_eq!(machine.status, SessionStatus::Streaming);

        let outcome = machine.on_event(
            SessionEvent::Message(r#"{"type":"exit","exitCode":0,"executionTimeMs":8}"#.into()),
            &tx,
        );
        assert!(matches!(outcome, Outcome::Finished));
        assert_eq!(machine.status, SessionStatus::Completed);
        assert_eq!(rx.try_recv().unwrap(), OutputFrame::stdout("1\n"));
        assert_eq!(rx.try_recv().unwrap(), OutputFrame::exit(0, 8));
    }

    #[test]
    fn test_error_keeps_session_open() {
        let (mut machine, tx, mut rx) = machine_with_frames(false);

        let outcome = machine.on_event(
            SessionEvent::Message(r#"{"type":"error","message":"Execution timed out"}"#.into()),
            &tx,
        );
        assert!(matches!(outcome, Outcome::Continue));
        assert_eq!(machine.status, SessionStatus::Streaming);
        assert_eq!(rx.try_recv().unwrap(), OutputFrame::error("Execution timed out"));
    }

    #[test]
    fn test_error_terminates_when_configured() {
        let (mut machine, tx, _rx) = machine_with_frames(true);

        let outcome = machine.on_event(
            SessionEvent::Message(r#"{"type":"error","message":"boom"}"#.into()),
            &tx,
        );
        assert!(matches!(outcome, Outcome::Finished));
        assert_eq!(machine.status, SessionStatus::Failed);
    }

    #[test]
    fn test_dispatch_failure_falls_back() {
        let (mut machine, tx, _rx) = machine_with_frames(false);

        let outcome = machine.on_event(SessionEvent::DispatchFailed(TransportError::ConnectionClosed), &tx);
        assert!(matches!(outcome, Outcome::FallBack(TransportError::ConnectionClosed)));
        assert_eq!(machine.status, SessionStatus::Pending);
    }

    #[test]
    fn test_dispatch_claim_goes_to_first_taker() {
        let claim = DispatchClaim::default();
        assert!(claim.take());
        assert!(!claim.take());
    }

    #[cfg(feature = "memory")]
    #[tokio::test(start_paused = true)]
    async fn test_timeout_waits_for_dispatch_already_running() {
        use crate::storage::MemoryStorage;

        #[derive(Default)]
        struct CountingFallback(std::sync::atomic::AtomicUsize);

        #[async_trait::async_trait]
        impl FallbackExecutor for CountingFallback {
            async fn execute_once(
                &self,
                _request: &ExecutionRequest,
            ) -> Result<runbox_core::ExecutionResponse, runbox_core::traits::ExecuteError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(runbox_core::traits::ExecuteError::Request("unreachable".to_string()))
            }
        }

        let storage = Arc::new(MemoryStorage::new());
        let request = ExecutionRequest::new("print(1)", runbox_core::Language::Python);
        let session = storage.create(&request).await.unwrap();
        let fallback = Arc::new(CountingFallback::default());
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        let run = SessionRun {
            id: session.id,
            request,
            storage: Arc::clone(&storage),
            fallback: Arc::clone(&fallback),
            frames: frames_tx,
            recorded: SessionStatus::Pending,
        };

        // The queued action has taken the claim but not reported back yet.
        let claim = Arc::new(DispatchClaim::default());
        assert!(claim.take());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run.stream(events_rx, claim, Some(Duration::from_secs(1)), false));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!task.is_finished());

        events_tx
            .send(SessionEvent::Message(r#"{"type":"exit","exitCode":0,"executionTimeMs":8}"#.into()))
            .unwrap();
        assert_eq!(frames_rx.recv().await, Some(OutputFrame::exit(0, 8)));
        task.await.unwrap();
        assert_eq!(fallback.0.load(Ordering::SeqCst), 0);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_topic_for() {
        let options = OrchestratorOptions::default();
        let id = uuid::Uuid::nil();
        assert_eq!(
            options.topic_for(id),
            "/topic/execution/00000000-0000-0000-0000-000000000000/output"
        );
    }
}
