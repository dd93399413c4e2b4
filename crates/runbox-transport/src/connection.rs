//! Long-lived publish/subscribe connection.
//!
//! [`StreamTransport`] owns one STOMP connection for the whole process. Work
//! that needs the network goes through [`StreamTransport::run_when_connected`]:
//! it runs immediately while connected, otherwise it is queued and replayed in
//! FIFO order, exactly once, the next time the connection comes up.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    TransportError,
    protocol::{Command, StompFrame},
};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, not yet activated.
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Handshake complete; frames may be sent.
    Connected,
    /// Lost, failed, or deactivated.
    Disconnected,
}

/// An established broker connection as a pair of frame channels.
///
/// The link is closed when `inbound` yields `None`.
pub struct Link {
    /// Frames to the broker.
    pub outbound: mpsc::UnboundedSender<StompFrame>,
    /// Frames from the broker.
    pub inbound: mpsc::UnboundedReceiver<StompFrame>,
}

/// Establishes broker connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection and complete the STOMP handshake.
    async fn connect(&self) -> Result<Link, TransportError>;
}

type Handler = Arc<dyn Fn(String) + Send + Sync>;
type PendingAction = Box<dyn FnOnce(&Channel<'_>) + Send>;

struct Route {
    destination: String,
    handler: Handler,
}

struct Inner {
    state: ConnectionState,
    activated: bool,
    deactivated: bool,
    // Set while queued actions are replayed so new ones keep FIFO order.
    draining: bool,
    pending: VecDeque<PendingAction>,
    outbound: Option<mpsc::UnboundedSender<StompFrame>>,
    routes: HashMap<String, Route>,
    next_subscription: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    connector: Arc<dyn Connector>,
    reconnect_delay: Duration,
}

/// Process-wide publish/subscribe transport.
///
/// Cloning is cheap and every clone drives the same connection. Construct one
/// per process, call [`activate`](Self::activate) once, and pass clones to
/// whatever needs the stream.
#[derive(Clone)]
pub struct StreamTransport {
    shared: Arc<Shared>,
}

impl StreamTransport {
    /// Create an idle transport.
    #[must_use]
    pub fn new(connector: impl Connector, reconnect_delay: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    activated: false,
                    deactivated: false,
                    draining: false,
                    pending: VecDeque::new(),
                    outbound: None,
                    routes: HashMap::new(),
                    next_subscription: 0,
                }),
                state_tx,
                shutdown_tx,
                connector: Arc::new(connector),
                reconnect_delay,
            }),
        }
    }

    /// Start connecting in the background. Idempotent.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn activate(&self) {
        {
            let mut inner = self.shared.lock();
            if inner.activated || inner.deactivated {
                return;
            }
            inner.activated = true;
        }
        info!("activating stream transport");
        tokio::spawn(drive(Arc::clone(&self.shared)));
    }

    /// Run `action` now if connected, otherwise queue it until the
    /// connection comes up. Queued actions never expire.
    pub fn run_when_connected<F>(&self, action: F)
    where
        F: FnOnce(&Channel<'_>) + Send + 'static,
    {
        let mut inner = self.shared.lock();
        if inner.deactivated {
            drop(inner);
            warn!("stream transport deactivated, dropping action");
            return;
        }
        if inner.state == ConnectionState::Connected && !inner.draining {
            drop(inner);
            action(&Channel {
                shared: &self.shared,
            });
            return;
        }
        inner.pending.push_back(Box::new(action));
        debug!(
            pending = inner.pending.len(),
            state = ?inner.state,
            "deferring action until connected"
        );
    }

    /// Close the connection and release every subscription. Idempotent.
    ///
    /// Queued actions are discarded and later ones are dropped.
    pub fn deactivate(&self) {
        let (pending, routes) = {
            let mut inner = self.shared.lock();
            if inner.deactivated {
                return;
            }
            inner.deactivated = true;
            if let Some(outbound) = inner.outbound.take() {
                let _ = outbound.send(StompFrame::disconnect());
            }
            inner.state = ConnectionState::Disconnected;
            (
                std::mem::take(&mut inner.pending),
                std::mem::take(&mut inner.routes),
            )
        };
        info!(
            discarded_actions = pending.len(),
            released_subscriptions = routes.len(),
            "deactivating stream transport"
        );
        drop(pending);
        drop(routes);
        self.shared
            .state_tx
            .send_replace(ConnectionState::Disconnected);
        self.shared.shutdown_tx.send_replace(true);
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Number of actions waiting for a connection.
    #[must_use]
    pub fn pending_actions(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.shared.lock().routes.len()
    }
}

impl fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("StreamTransport")
            .field("state", &inner.state)
            .field("pending", &inner.pending.len())
            .field("subscriptions", &inner.routes.len())
            .finish_non_exhaustive()
    }
}

/// Access to a connected transport, lent to actions passed to
/// [`StreamTransport::run_when_connected`].
pub struct Channel<'a> {
    shared: &'a Arc<Shared>,
}

impl Channel<'_> {
    /// Subscribe to `destination`. `on_message` is called once per message
    /// body until the returned handle is cancelled or dropped.
    ///
    /// # Errors
    /// Returns error if the connection is no longer usable.
    pub fn subscribe<F>(&self, destination: &str, on_message: F) -> Result<Subscription, TransportError>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let mut inner = self.shared.lock();
        let outbound = inner.outbound.clone().ok_or(TransportError::NotConnected)?;
        let id = format!("sub-{}", inner.next_subscription);
        inner.next_subscription += 1;
        outbound
            .send(StompFrame::subscribe(&id, destination))
            .map_err(|_| TransportError::ConnectionClosed)?;
        inner.routes.insert(
            id.clone(),
            Route {
                destination: destination.to_string(),
                handler: Arc::new(on_message),
            },
        );
        debug!(subscription = %id, destination, "subscribed");
        Ok(Subscription {
            id,
            destination: destination.to_string(),
            shared: Arc::clone(self.shared),
            released: AtomicBool::new(false),
        })
    }

    /// Send `payload` to `destination`. Fire-and-forget.
    ///
    /// # Errors
    /// Returns error if the connection is no longer usable.
    pub fn publish(&self, destination: &str, payload: impl Into<String>) -> Result<(), TransportError> {
        let outbound = self
            .shared
            .lock()
            .outbound
            .clone()
            .ok_or(TransportError::NotConnected)?;
        outbound
            .send(StompFrame::send(destination, payload))
            .map_err(|_| TransportError::ConnectionClosed)?;
        debug!(destination, "published");
        Ok(())
    }
}

/// Handle to a live subscription.
///
/// Released exactly once: on [`cancel`](Self::cancel), on drop, or when the
/// transport is deactivated.
pub struct Subscription {
    id: String,
    destination: String,
    shared: Arc<Shared>,
    released: AtomicBool,
}

impl Subscription {
    /// Subscription id on the wire.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribed destination.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Whether messages are still delivered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.released.load(Ordering::SeqCst) && self.shared.lock().routes.contains_key(&self.id)
    }

    /// Stop delivery. Idempotent.
    pub fn cancel(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let route = {
            let mut inner = self.shared.lock();
            let route = inner.routes.remove(&self.id);
            if route.is_some() {
                if let Some(outbound) = &inner.outbound {
                    let _ = outbound.send(StompFrame::unsubscribe(&self.id));
                }
            }
            route
        };
        if route.is_some() {
            debug!(subscription = %self.id, destination = %self.destination, "unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            debug!(from = ?inner.state, to = ?state, "transport state changed");
        }
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn set_state(&self, state: ConnectionState) {
        let mut inner = self.lock();
        if !inner.deactivated {
            self.transition(&mut inner, state);
        }
    }

    fn on_connected(self: &Arc<Self>, outbound: mpsc::UnboundedSender<StompFrame>) {
        {
            let mut inner = self.lock();
            if inner.deactivated {
                return;
            }
            // Subscriptions die with the old connection; re-issue them.
            for (id, route) in &inner.routes {
                debug!(subscription = %id, destination = %route.destination, "resubscribing");
                let _ = outbound.send(StompFrame::subscribe(id, &route.destination));
            }
            inner.outbound = Some(outbound);
            inner.draining = true;
            self.transition(&mut inner, ConnectionState::Connected);
        }
        info!("stream transport connected");
        self.drain_pending();
    }

    fn drain_pending(self: &Arc<Self>) {
        let mut replayed = 0usize;
        loop {
            let action = {
                let mut inner = self.lock();
                if let Some(action) = inner.pending.pop_front() {
                    action
                } else {
                    inner.draining = false;
                    break;
                }
            };
            action(&Channel { shared: self });
            replayed += 1;
        }
        if replayed > 0 {
            debug!(replayed, "replayed deferred actions");
        }
    }

    fn on_disconnected(&self) {
        let mut inner = self.lock();
        if inner.deactivated {
            return;
        }
        inner.outbound = None;
        self.transition(&mut inner, ConnectionState::Disconnected);
    }

    fn dispatch(&self, frame: StompFrame) {
        match frame.command {
            Command::Message => {
                let handler = {
                    let inner = self.lock();
                    frame
                        .get_header("subscription")
                        .and_then(|id| inner.routes.get(id))
                        .map(|route| Arc::clone(&route.handler))
                };
                match handler {
                    Some(handler) => handler(frame.body),
                    None => debug!(
                        subscription = frame.get_header("subscription").unwrap_or_default(),
                        "dropping message for released subscription"
                    ),
                }
            }
            Command::Error => error!(
                message = frame.get_header("message").unwrap_or_default(),
                body = %frame.body,
                "broker reported an error"
            ),
            Command::Receipt | Command::Connected => {}
            other => debug!(command = %other, "ignoring unexpected frame"),
        }
    }

    async fn serve(self: &Arc<Self>, mut link: Link, shutdown: &mut watch::Receiver<bool>) {
        self.on_connected(link.outbound.clone());
        loop {
            tokio::select! {
                frame = link.inbound.recv() => match frame {
                    Some(frame) => self.dispatch(frame),
                    None => {
                        warn!("stream transport connection lost");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
    }
}

async fn drive(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown_tx.subscribe();
    loop {
        if *shutdown.borrow() {
            break;
        }
        shared.set_state(ConnectionState::Connecting);
        let attempt = tokio::select! {
            result = shared.connector.connect() => result,
            _ = shutdown.changed() => break,
        };
        match attempt {
            Ok(link) => shared.serve(link, &mut shutdown).await,
            Err(e) => warn!(error = %e, "stream transport connection failed"),
        }
        if *shutdown.borrow() {
            break;
        }
        shared.on_disconnected();
        debug!(
            delay_ms = u64::try_from(shared.reconnect_delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );
        tokio::select! {
            () = tokio::time::sleep(shared.reconnect_delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("stream transport driver stopped");
}
