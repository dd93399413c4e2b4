//! Run controller: the "Run" action between an editor and a terminal.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use runbox_core::{
    Editor, ExecutionRequest, FallbackExecutor, OutputFrame, SessionId, SessionStorage, Terminal,
    traits::TerminalStyle,
};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::orchestrator::{FrameStream, SessionOrchestrator};

/// Snapshot of the controller's run state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunState {
    /// A run is in flight; further runs are ignored.
    pub is_running: bool,
    /// Exit code of the last finished run.
    pub last_exit_code: Option<i32>,
    /// Server-measured duration of the last finished run.
    pub last_execution_time_ms: Option<u64>,
    /// Session of the run in flight.
    pub active_session: Option<SessionId>,
}

/// Run state plus the number of the run it belongs to.
///
/// `generation` moves on whenever a run starts or is abandoned, so work
/// left over from an earlier run can tell it no longer owns the state.
#[derive(Debug, Default)]
struct Tracked {
    run: RunState,
    generation: u64,
}

type SharedState = Arc<Mutex<Tracked>>;

/// Starts runs and relays their output to a terminal.
///
/// At most one run is in flight at a time.
pub struct RunController<S, F, T>
where
    S: SessionStorage,
    F: FallbackExecutor,
    T: Terminal,
{
    orchestrator: Arc<SessionOrchestrator<S, F>>,
    terminal: Arc<T>,
    state: SharedState,
    relay: Mutex<Option<AbortHandle>>,
}

impl<S, F, T> RunController<S, F, T>
where
    S: SessionStorage + 'static,
    F: FallbackExecutor + 'static,
    T: Terminal + 'static,
{
    #[must_use]
    pub fn new(orchestrator: Arc<SessionOrchestrator<S, F>>, terminal: Arc<T>) -> Self {
        Self {
            orchestrator,
            terminal,
            state: Arc::new(Mutex::new(Tracked::default())),
            relay: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn orchestrator(&self) -> &SessionOrchestrator<S, F> {
        &self.orchestrator
    }

    /// Current run state.
    #[must_use]
    pub fn state(&self) -> RunState {
        lock(&self.state).run.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.state).run.is_running
    }

    /// Run the editor's current buffer.
    pub async fn run_from_editor<E>(&self, editor: &E, stdin: Option<String>) -> Option<JoinHandle<()>>
    where
        E: Editor + ?Sized,
    {
        let mut request = ExecutionRequest::new(editor.current_code(), editor.selected_language());
        request.stdin = stdin;
        self.run(request).await
    }

    /// Start a run.
    ///
    /// Ignored while another run is in flight. An invalid request is
    /// reported on the terminal and never dispatched. Returns the relay
    /// task, which finishes when the run does. Returns `None` as well when
    /// [`shutdown`](Self::shutdown) abandons the run before it has started.
    pub async fn run(&self, request: ExecutionRequest) -> Option<JoinHandle<()>> {
        let generation = {
            let mut state = lock(&self.state);
            if state.run.is_running {
                debug!("run already in progress, ignoring");
                return None;
            }
            if let Err(e) = request.validate() {
                drop(state);
                warn!(error = %e, "refusing to run invalid request");
                self.terminal.write_styled(&format!("Error: {e}\n"), TerminalStyle::Error);
                return None;
            }
            state.generation += 1;
            state.run.is_running = true;
            state.run.last_exit_code = None;
            state.run.last_execution_time_ms = None;
            state.generation
        };

        self.terminal.reset();
        let frames = match self.orchestrator.execute(request).await {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "failed to start run");
                self.terminal.write_styled(&format!("Error: {e}\n"), TerminalStyle::Error);
                let mut state = lock(&self.state);
                if state.generation == generation {
                    state.run.is_running = false;
                    state.run.active_session = None;
                }
                return None;
            }
        };

        let mut state = lock(&self.state);
        if state.generation != generation {
            // Dropping the frames abandons the session.
            info!(session_id = %frames.session_id(), "run abandoned while starting");
            return None;
        }
        state.run.active_session = Some(frames.session_id());
        let handle = tokio::spawn(relay(
            frames,
            Arc::clone(&self.terminal),
            Arc::clone(&self.state),
            generation,
        ));
        *lock(&self.relay) = Some(handle.abort_handle());
        drop(state);
        Some(handle)
    }

    /// Abandon the run in flight, if any, and release its session.
    ///
    /// A run that is still starting is abandoned as soon as its session
    /// exists.
    pub fn shutdown(&self) {
        let mut state = lock(&self.state);
        if let Some(relay) = lock(&self.relay).take() {
            relay.abort();
        }
        if state.run.is_running {
            info!(session_id = ?state.run.active_session, "abandoning run");
        }
        state.generation += 1;
        state.run.is_running = false;
        state.run.active_session = None;
    }
}

impl<S, F, T> Drop for RunController<S, F, T>
where
    S: SessionStorage,
    F: FallbackExecutor,
    T: Terminal,
{
    fn drop(&mut self) {
        if let Some(relay) = lock(&self.relay).take() {
            relay.abort();
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn relay<T: Terminal>(
    mut frames: FrameStream,
    terminal: Arc<T>,
    state: SharedState,
    generation: u64,
) {
    let session_id = frames.session_id();
    while let Some(frame) = frames.next().await {
        match frame {
            OutputFrame::Stdout { data } => terminal.write(&data),
            OutputFrame::Stderr { data } => terminal.write_styled(&data, TerminalStyle::Error),
            OutputFrame::Error { message } => {
                terminal.write_styled(&format!("Error: {message}\n"), TerminalStyle::Error);
            }
            OutputFrame::Exit {
                exit_code,
                execution_time_ms,
            } => {
                info!(session_id = %session_id, exit_code, execution_time_ms, "run finished");
                let mut state = lock(&state);
                if state.generation == generation {
                    state.run.is_running = false;
                    state.run.last_exit_code = Some(exit_code);
                    state.run.last_execution_time_ms = Some(execution_time_ms);
                    state.run.active_session = None;
                }
                return;
            }
        }
    }

    // No exit will come; let the next run start.
    warn!(session_id = %session_id, "output ended without an exit");
    let mut state = lock(&state);
    if state.generation == generation {
        state.run.is_running = false;
        state.run.active_session = None;
    }
}
