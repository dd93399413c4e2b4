//! Publish/subscribe transport for streamed execution output.
//!
//! Provides:
//! - STOMP frame codec
//! - `StreamTransport` - connection state machine with deferred actions
//! - WebSocket connector (feature: websocket)
//! - In-process broker (feature: memory)

pub mod connection;
pub mod error;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(any(test, feature = "memory"))]
pub mod memory;

pub use connection::{Channel, ConnectionState, Connector, Link, StreamTransport, Subscription};
pub use error::TransportError;
pub use protocol::{Command, StompFrame};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

#[cfg(any(test, feature = "memory"))]
pub use memory::{BrokerEvent, MemoryBroker};
