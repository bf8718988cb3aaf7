//! In-process mock gateway server
//!
//! Accepts real WebSocket connections from shards and lets a test script
//! the server side of the conversation frame by frame.

use futures_util::{SinkExt, StreamExt};
use quill_gateway::protocol::{GatewayMessage, OpCode};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// How long a test waits for an expected frame or connection
const EXPECT_TIMEOUT: Duration = Duration::from_secs(15);

/// A listening mock gateway
pub struct MockGateway {
    /// Base URL shards should connect to
    pub url: String,
    connections: mpsc::Receiver<GatewayConn>,
    _accept_task: JoinHandle<()>,
}

impl MockGateway {
    /// Bind on an ephemeral port and start accepting
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(8);

        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                if tx.send(GatewayConn { ws }).await.is_err() {
                    return;
                }
            }
        });

        Self {
            url: format!("ws://{addr}"),
            connections: rx,
            _accept_task: accept_task,
        }
    }

    /// Wait for the next shard connection
    pub async fn next_conn(&mut self) -> GatewayConn {
        tokio::time::timeout(EXPECT_TIMEOUT, self.connections.recv())
            .await
            .expect("timed out waiting for a shard to connect")
            .expect("mock gateway accept loop ended")
    }
}

/// The server side of one shard connection
pub struct GatewayConn {
    ws: WebSocketStream<TcpStream>,
}

impl GatewayConn {
    pub async fn send(&mut self, message: &GatewayMessage) {
        let json = message.to_json().unwrap();
        self.ws.send(Message::Text(json)).await.unwrap();
    }

    /// Read the next payload, skipping control frames; `None` once the
    /// shard is gone
    pub async fn recv(&mut self) -> Option<GatewayMessage> {
        loop {
            let frame = tokio::time::timeout(EXPECT_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a client frame")?;
            match frame {
                Ok(Message::Text(text)) => {
                    return Some(GatewayMessage::from_json(&text).unwrap())
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Read until a payload with the given op arrives
    pub async fn expect_op(&mut self, op: OpCode) -> GatewayMessage {
        loop {
            let message = self
                .recv()
                .await
                .unwrap_or_else(|| panic!("connection ended while expecting {op}"));
            if message.op == op {
                return message;
            }
        }
    }

    /// Assert the connection ends (close frame or drop) within the timeout
    pub async fn expect_end(&mut self) {
        while self.recv().await.is_some() {}
    }

    pub async fn hello(&mut self, heartbeat_interval_ms: u64) {
        self.send(&GatewayMessage {
            op: OpCode::Hello,
            d: Some(json!({ "heartbeat_interval": heartbeat_interval_ms })),
            s: None,
            t: None,
        })
        .await;
    }

    pub async fn dispatch(&mut self, name: &str, seq: u64, data: Value) {
        self.send(&GatewayMessage {
            op: OpCode::Dispatch,
            d: Some(data),
            s: Some(seq),
            t: Some(name.to_string()),
        })
        .await;
    }

    pub async fn ready(&mut self, seq: u64, session_id: &str, guild_ids: &[&str]) {
        let guilds: Vec<Value> = guild_ids
            .iter()
            .map(|id| json!({ "id": id, "unavailable": true }))
            .collect();
        self.dispatch(
            "READY",
            seq,
            json!({ "v": 10, "session_id": session_id, "guilds": guilds }),
        )
        .await;
    }

    pub async fn resumed(&mut self, seq: u64) {
        self.dispatch("RESUMED", seq, Value::Null).await;
    }

    pub async fn invalid_session(&mut self, resumable: bool) {
        self.send(&GatewayMessage {
            op: OpCode::InvalidSession,
            d: Some(Value::Bool(resumable)),
            s: None,
            t: None,
        })
        .await;
    }

    pub async fn heartbeat_ack(&mut self) {
        self.send(&GatewayMessage {
            op: OpCode::HeartbeatAck,
            d: None,
            s: None,
            t: None,
        })
        .await;
    }
}
