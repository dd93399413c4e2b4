use std::{collections::HashMap, net::SocketAddr, time::Duration};

use axum::{
    Router,
    extract::{
        WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use runbox_transport::{
    Command, ConnectionState, Connector, StompFrame, StreamTransport, TransportError,
    WebSocketConnector,
};
use tokio::sync::{mpsc, oneshot};

/// Minimal STOMP broker that answers every execute command with two frames.
async fn stomp_stub(socket: WebSocket, reject: bool) {
    let (mut tx, mut rx) = socket.split();
    let mut subscriptions: HashMap<String, String> = HashMap::new();
    let mut message_id = 0u32;

    while let Some(Ok(msg)) = rx.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(frame) = StompFrame::decode(text.as_str()) else {
            continue;
        };
        let replies = match frame.command {
            Command::Connect if reject => vec![
                StompFrame::new(Command::Error).header("message", "bad credentials"),
            ],
            Command::Connect => vec![StompFrame::new(Command::Connected).header("version", "1.2")],
            Command::Subscribe => {
                subscriptions.insert(
                    frame.get_header("destination").unwrap().to_string(),
                    frame.get_header("id").unwrap().to_string(),
                );
                vec![]
            }
            Command::Send => {
                let body: serde_json::Value = serde_json::from_str(&frame.body).unwrap();
                let topic = format!(
                    "/topic/execution/{}/output",
                    body["sessionId"].as_str().unwrap()
                );
                let Some(id) = subscriptions.get(&topic) else {
                    continue;
                };
                [
                    r#"{"type":"stdout","data":"1\n"}"#,
                    r#"{"type":"exit","exitCode":0,"executionTimeMs":8}"#,
                ]
                .into_iter()
                .map(|payload| {
                    message_id += 1;
                    StompFrame::new(Command::Message)
                        .header("destination", topic.as_str())
                        .header("subscription", id.as_str())
                        .header("message-id", message_id.to_string())
                        .body(payload)
                })
                .collect()
            }
            Command::Disconnect => break,
            _ => vec![],
        };
        for reply in replies {
            if tx.send(Message::Text(reply.encode().into())).await.is_err() {
                return;
            }
        }
    }
}

async fn spawn_stub(reject: bool) -> SocketAddr {
    let app = Router::new().route(
        "/ws",
        get(move |ws: WebSocketUpgrade| async move {
            ws.on_upgrade(move |socket| stomp_stub(socket, reject))
                .into_response()
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_streams_frames_over_websocket() {
    let addr = spawn_stub(false).await;
    let connector = WebSocketConnector::new(format!("ws://{addr}/ws"), Duration::from_secs(5));
    let transport = StreamTransport::new(connector, Duration::from_millis(100));
    transport.activate();

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let (sub_tx, sub_rx) = oneshot::channel();
    transport.run_when_connected(move |channel| {
        let sub = channel
            .subscribe("/topic/execution/s1/output", move |body| {
                let _ = msg_tx.send(body);
            })
            .unwrap();
        channel
            .publish(
                "/app/execute",
                r#"{"sessionId":"s1","code":"print(1)","language":"python"}"#,
            )
            .unwrap();
        let _ = sub_tx.send(sub);
    });

    let _sub = sub_rx.await.unwrap();
    assert_eq!(msg_rx.recv().await.unwrap(), r#"{"type":"stdout","data":"1\n"}"#);
    assert_eq!(
        msg_rx.recv().await.unwrap(),
        r#"{"type":"exit","exitCode":0,"executionTimeMs":8}"#
    );
    assert_eq!(transport.state(), ConnectionState::Connected);
    transport.deactivate();
}

#[tokio::test]
async fn test_broker_error_rejects_handshake() {
    let addr = spawn_stub(true).await;
    let connector = WebSocketConnector::new(format!("ws://{addr}/ws"), Duration::from_secs(5));

    match connector.connect().await {
        Err(TransportError::Rejected(reason)) => assert_eq!(reason, "bad credentials"),
        Err(other) => panic!("Wrong error: {other}"),
        Ok(_) => panic!("Handshake should fail"),
    }
}

#[tokio::test]
async fn test_silent_server_times_out() {
    // Accepts TCP but never speaks WebSocket.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connector = WebSocketConnector::new(format!("ws://{addr}/ws"), Duration::from_millis(200));

    assert!(matches!(
        connector.connect().await,
        Err(TransportError::Timeout)
    ));
    drop(listener);
}

#[tokio::test]
async fn test_unreachable_endpoint_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let connector = WebSocketConnector::new(format!("ws://{addr}/ws"), Duration::from_secs(5));

    assert!(matches!(
        connector.connect().await,
        Err(TransportError::ConnectFailed(_))
    ));
}
