//! In-process STOMP broker.
//!
//! Useful for tests and offline development. Records every frame it receives
//! so call order can be asserted, and can answer `SEND` frames with scripted
//! messages.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    TransportError,
    connection::{Connector, Link},
    protocol::{Command, StompFrame},
};

/// Something the broker observed, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    Subscribed { destination: String },
    Unsubscribed { destination: String },
    Published { destination: String, body: String },
    Disconnected,
}

type Responder = Arc<dyn Fn(&str, &str) -> Vec<(String, String)> + Send + Sync>;

struct Conn {
    tx: mpsc::UnboundedSender<StompFrame>,
    // destination by subscription id
    subscriptions: HashMap<String, String>,
}

struct Inner {
    available: bool,
    half_open: bool,
    connect_attempts: usize,
    next_conn: u64,
    next_message: u64,
    connections: HashMap<u64, Conn>,
    events: Vec<BrokerEvent>,
    responder: Option<Responder>,
}

/// In-memory broker acting as a [`Connector`].
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a broker that accepts connections.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                available: true,
                half_open: false,
                connect_attempts: 0,
                next_conn: 0,
                next_message: 0,
                connections: HashMap::new(),
                events: Vec::new(),
                responder: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept (`true`) or refuse (`false`) new connections.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Hand out connections whose outbound side is already closed, so every
    /// subscribe or publish on them fails.
    pub fn set_half_open(&self, half_open: bool) {
        self.lock().half_open = half_open;
    }

    /// Answer each `SEND` with messages `(destination, body)` to deliver.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&str, &str) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        self.lock().responder = Some(Arc::new(responder));
    }

    /// Deliver a message to every subscriber of `destination`.
    ///
    /// Returns the number of subscribers reached.
    pub fn deliver(&self, destination: &str, body: &str) -> usize {
        let mut inner = self.lock();
        Self::deliver_locked(&mut inner, destination, body)
    }

    fn deliver_locked(inner: &mut Inner, destination: &str, body: &str) -> usize {
        let mut delivered = 0;
        let mut message_id = inner.next_message;
        for conn in inner.connections.values() {
            for (id, dest) in &conn.subscriptions {
                if dest != destination {
                    continue;
                }
                let frame = StompFrame::new(Command::Message)
                    .header("destination", destination)
                    .header("subscription", id.as_str())
                    .header("message-id", message_id.to_string())
                    .body(body);
                message_id += 1;
                if conn.tx.send(frame).is_ok() {
                    delivered += 1;
                }
            }
        }
        inner.next_message = message_id;
        delivered
    }

    /// Drop every open connection, as a network loss would.
    pub fn drop_connections(&self) {
        let dropped: Vec<Conn> = self.lock().connections.drain().map(|(_, c)| c).collect();
        drop(dropped);
    }

    /// Everything received so far.
    #[must_use]
    pub fn events(&self) -> Vec<BrokerEvent> {
        self.lock().events.clone()
    }

    /// Number of connection attempts, refused ones included.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Number of subscribers on `destination`.
    #[must_use]
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.lock()
            .connections
            .values()
            .flat_map(|c| c.subscriptions.values())
            .filter(|d| *d == destination)
            .count()
    }

    fn handle(&self, conn_id: u64, frame: StompFrame) {
        let mut inner = self.lock();
        match frame.command {
            Command::Subscribe => {
                let (Some(id), Some(destination)) =
                    (frame.get_header("id"), frame.get_header("destination"))
                else {
                    return;
                };
                if let Some(conn) = inner.connections.get_mut(&conn_id) {
                    conn.subscriptions
                        .insert(id.to_string(), destination.to_string());
                }
                inner.events.push(BrokerEvent::Subscribed {
                    destination: destination.to_string(),
                });
            }
            Command::Unsubscribe => {
                let removed = frame.get_header("id").and_then(|id| {
                    inner
                        .connections
                        .get_mut(&conn_id)
                        .and_then(|c| c.subscriptions.remove(id))
                });
                if let Some(destination) = removed {
                    inner.events.push(BrokerEvent::Unsubscribed { destination });
                }
            }
            Command::Send => {
                let destination = frame.get_header("destination").unwrap_or_default().to_string();
                inner.events.push(BrokerEvent::Published {
                    destination: destination.clone(),
                    body: frame.body.clone(),
                });
                let replies = inner
                    .responder
                    .clone()
                    .map(|respond| respond(&destination, &frame.body))
                    .unwrap_or_default();
                for (topic, body) in replies {
                    Self::deliver_locked(&mut inner, &topic, &body);
                }
            }
            Command::Disconnect => {
                inner.connections.remove(&conn_id);
                inner.events.push(BrokerEvent::Disconnected);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Link, TransportError> {
        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<StompFrame>();
        let (broker_tx, broker_rx) = mpsc::unbounded_channel::<StompFrame>();

        let (conn_id, half_open) = {
            let mut inner = self.lock();
            inner.connect_attempts += 1;
            if !inner.available {
                return Err(TransportError::ConnectFailed(
                    "broker unavailable".to_string(),
                ));
            }
            let conn_id = inner.next_conn;
            inner.next_conn += 1;
            inner.connections.insert(
                conn_id,
                Conn {
                    tx: broker_tx,
                    subscriptions: HashMap::new(),
                },
            );
            inner.events.push(BrokerEvent::Connected);
            (conn_id, inner.half_open)
        };

        if half_open {
            drop(client_rx);
        } else {
            let broker = self.clone();
            tokio::spawn(async move {
                while let Some(frame) = client_rx.recv().await {
                    broker.handle(conn_id, frame);
                }
            });
        }

        Ok(Link {
            outbound: client_tx,
            inbound: broker_rx,
        })
    }
}
