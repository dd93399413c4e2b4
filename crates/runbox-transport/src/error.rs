//! Transport error.

use crate::protocol::DecodeError;

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Connect timed out")]
    Timeout,
    #[error("Broker rejected connection: {0}")]
    Rejected(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] DecodeError),
    #[error("Dispatch still queued after {0:?}")]
    QueueTimeout(std::time::Duration),
    #[error("Transport deactivated")]
    Deactivated,
}
