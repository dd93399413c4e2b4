//! STOMP over WebSocket connector.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, warn};

use crate::{
    TransportError,
    connection::{Connector, Link},
    protocol::{Command, StompFrame, is_heartbeat},
};

/// Connects to a STOMP broker exposed on a WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector for `url` (`ws://host:port/path`).
    #[must_use]
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn handshake(&self) -> Result<Link, TransportError> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let connect = StompFrame::connect(host_of(&self.url));
        sink.send(Message::Text(connect.encode().into()))
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        wait_for_connected(&mut stream).await?;
        debug!(url = %self.url, "STOMP session established");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<StompFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<StompFrame>();

        // Forward outgoing frames to the socket
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let last = frame.command == Command::Disconnect;
                if let Err(e) = sink.send(Message::Text(frame.encode().into())).await {
                    warn!("WebSocket send failed: {e}");
                    break;
                }
                if last {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Decode incoming frames until the socket closes
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => s,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("WebSocket error: {e}");
                        break;
                    }
                };
                if is_heartbeat(&text) {
                    continue;
                }
                match StompFrame::decode(&text) {
                    Ok(frame) => {
                        if in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping undecodable STOMP frame: {e}"),
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        tokio::time::timeout(self.connect_timeout, self.handshake())
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

async fn wait_for_connected<S>(stream: &mut S) -> Result<(), TransportError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Close(_)) => return Err(TransportError::ConnectionClosed),
            Ok(_) => continue,
            Err(e) => return Err(TransportError::ConnectFailed(e.to_string())),
        };
        if is_heartbeat(&text) {
            continue;
        }
        let frame = StompFrame::decode(&text)?;
        match frame.command {
            Command::Connected => return Ok(()),
            Command::Error => {
                let reason = frame
                    .get_header("message")
                    .map_or_else(|| frame.body.clone(), str::to_string);
                return Err(TransportError::Rejected(reason));
            }
            other => debug!(command = %other, "ignoring frame before CONNECTED"),
        }
    }
    Err(TransportError::ConnectionClosed)
}

/// `host[:port]` part of a WebSocket URL, used as the STOMP virtual host.
fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', '?', '#']).next().unwrap_or(rest)
}
