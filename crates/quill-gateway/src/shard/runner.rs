//! Shard runner
//!
//! The per-shard task driving the connection state machine: connect,
//! HELLO, resume-or-identify, heartbeats, dispatch, close classification,
//! and backoff.

use super::{Backoff, ShardMessage, ShardPhase, ShardSession};
use crate::compression::Inflater;
use crate::events::EventKind;
use crate::identify::{IdentifyGate, IdentifyTicket};
use crate::protocol::{
    CloseAction, CloseCode, GatewayMessage, Identify, IdentifyProperties, OpCode, Ready, Resume,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use quill_common::{ClientError, ClientResult, GatewayConfig};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
/// A parked identify-gate acquisition, polled alongside the socket so the
/// heartbeat keeps running while the shard waits its turn
type TicketTask = JoinHandle<ClientResult<IdentifyTicket>>;

/// Base reconnect delay; doubles per attempt up to the configured cap
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// What one connection attempt resolved to
enum Outcome {
    /// Shutdown requested; drain to `Idle`
    Shutdown,
    /// Reconnect after backoff, keeping the session iff resumable
    Retry { resumable: bool },
    /// Terminal; the shard moves to `Dead`
    Fatal(ClientError),
}

/// One frame read off the socket
enum Incoming {
    Payload(GatewayMessage),
    Closed(Option<u16>),
    Ended,
}

pub(crate) struct Runner {
    id: u16,
    count: u16,
    token: String,
    url: String,
    config: Arc<GatewayConfig>,
    gate: Arc<IdentifyGate>,
    session: ShardSession,
    backoff: Backoff,
    phase: ShardPhase,
    phase_tx: watch::Sender<ShardPhase>,
    messages: mpsc::Sender<ShardMessage>,
    shutdown_rx: watch::Receiver<bool>,
    /// Protocol faults on the current session; the second in a row drops it
    protocol_strikes: u32,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u16,
        count: u16,
        token: String,
        url: String,
        config: Arc<GatewayConfig>,
        gate: Arc<IdentifyGate>,
        phase_tx: watch::Sender<ShardPhase>,
        messages: mpsc::Sender<ShardMessage>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let backoff_cap = config.backoff_cap;
        Self {
            id,
            count,
            token,
            url,
            config,
            gate,
            session: ShardSession::default(),
            backoff: Backoff::new(BACKOFF_BASE, backoff_cap),
            phase: ShardPhase::Idle,
            phase_tx,
            messages,
            shutdown_rx,
            protocol_strikes: 0,
        }
    }

    /// Run the state machine until shutdown or a terminal error
    pub(crate) async fn run(mut self, start: oneshot::Receiver<()>) {
        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            started = start => {
                // A dropped handle means the shard never logs in
                if started.is_err() {
                    return;
                }
            }
            () = wait_shutdown(&mut shutdown) => return,
        }

        loop {
            self.set_phase(ShardPhase::Connecting);
            match self.connect_once().await {
                Outcome::Shutdown => {
                    self.set_phase(ShardPhase::Idle);
                    return;
                }
                Outcome::Fatal(error) => {
                    tracing::error!(shard = self.id, error = %error, "shard hit a terminal error");
                    self.set_phase(ShardPhase::Dead);
                    let _ = self
                        .messages
                        .send(ShardMessage::Fatal {
                            shard_id: self.id,
                            error,
                        })
                        .await;
                    return;
                }
                Outcome::Retry { resumable } => {
                    if !resumable {
                        self.session.clear();
                    }
                    self.set_phase(ShardPhase::Backoff);
                    let delay = self.backoff.next();
                    tracing::info!(
                        shard = self.id,
                        delay_ms = delay.as_millis() as u64,
                        resumable,
                        "reconnecting after backoff"
                    );
                    let mut shutdown = self.shutdown_rx.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        () = wait_shutdown(&mut shutdown) => {
                            self.set_phase(ShardPhase::Idle);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One full connection attempt, from dial to close
    async fn connect_once(&mut self) -> Outcome {
        let url = self.connect_url();
        let ws = match timeout(self.config.hello_timeout, connect_async(&url)).await {
            Err(_) => {
                tracing::warn!(shard = self.id, "gateway connect timed out");
                return Outcome::Retry { resumable: true };
            }
            Ok(Err(err)) => {
                tracing::warn!(shard = self.id, error = %err, "gateway connect failed");
                return Outcome::Retry { resumable: true };
            }
            Ok(Ok((ws, _response))) => ws,
        };

        let (mut sink, mut stream) = ws.split();
        let mut inflater = if self.config.compress {
            Some(Inflater::new())
        } else {
            None
        };
        let mut ticket: Option<IdentifyTicket> = None;
        let mut pending: Option<TicketTask> = None;

        let outcome = self
            .drive(&mut sink, &mut stream, &mut inflater, &mut ticket, &mut pending)
            .await;

        // A turn still parked or held here means the identify attempt failed
        if let Some(task) = pending.take() {
            task.abort();
            if let Ok(Ok(granted)) = task.await {
                granted.release().await;
            }
        }
        if let Some(ticket) = ticket.take() {
            ticket.release().await;
        }
        if matches!(outcome, Outcome::Shutdown) {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: WsCloseCode::Normal,
                    reason: "".into(),
                })))
                .await;
        }
        outcome
    }

    async fn drive(
        &mut self,
        sink: &mut WsSink,
        stream: &mut WsSource,
        inflater: &mut Option<Inflater>,
        ticket: &mut Option<IdentifyTicket>,
        pending: &mut Option<TicketTask>,
    ) -> Outcome {
        self.set_phase(ShardPhase::AwaitingHello);
        let mut shutdown = self.shutdown_rx.clone();

        let hello = tokio::select! {
            () = wait_shutdown(&mut shutdown) => return Outcome::Shutdown,
            result = timeout(self.config.hello_timeout, next_frame(stream, inflater)) => {
                match result {
                    Err(_) => {
                        tracing::warn!(shard = self.id, "timed out waiting for HELLO");
                        return Outcome::Retry { resumable: true };
                    }
                    Ok(Err(err)) => return self.fault(err),
                    Ok(Ok(Incoming::Closed(code))) => return self.close_outcome(code),
                    Ok(Ok(Incoming::Ended)) => return Outcome::Retry { resumable: true },
                    Ok(Ok(Incoming::Payload(message))) => match message.as_hello() {
                        Some(hello) => hello,
                        None => {
                            return self.fault(ClientError::Protocol(format!(
                                "expected HELLO, got op {}",
                                message.op
                            )))
                        }
                    },
                }
            }
        };

        if hello.heartbeat_interval == 0 {
            return self.fault(ClientError::Protocol(
                "HELLO specified a zero heartbeat interval".into(),
            ));
        }
        let interval = Duration::from_millis(hello.heartbeat_interval);

        // Resume an existing session, or park on the identify gate; either
        // way the heartbeat timer arms now
        if let Some((session_id, seq)) = self.session.resumable() {
            let resume = Resume {
                token: self.token.clone(),
                session_id: session_id.to_string(),
                seq,
            };
            self.set_phase(ShardPhase::Resuming);
            if let Err(err) = send(sink, &GatewayMessage::resume(&resume)).await {
                return self.fault(err);
            }
        } else {
            self.set_phase(ShardPhase::AwaitingIdentify);
            *pending = Some(self.spawn_acquire());
        }

        // First heartbeat lands a uniform random fraction into the interval
        // so shards started together do not beat together
        let mut next_beat =
            Instant::now() + interval.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
        let mut acked = true;

        loop {
            let lease_deadline = ticket
                .as_ref()
                .map_or_else(far_future, IdentifyTicket::expires_at);

            tokio::select! {
                () = wait_shutdown(&mut shutdown) => return Outcome::Shutdown,

                _ = sleep_until(next_beat) => {
                    if !acked {
                        tracing::warn!(shard = self.id, "heartbeat went unacknowledged, reconnecting");
                        return Outcome::Retry { resumable: true };
                    }
                    if let Err(err) = send(sink, &GatewayMessage::heartbeat(self.session.seq())).await {
                        return self.fault(err);
                    }
                    acked = false;
                    next_beat = Instant::now() + interval;
                }

                granted = poll_ticket(pending), if pending.is_some() => {
                    *pending = None;
                    match flatten_ticket(granted) {
                        Ok(granted) => {
                            if let Some(outcome) = self.send_identify(sink, granted, ticket).await {
                                return outcome;
                            }
                        }
                        Err(err) => {
                            tracing::error!(shard = self.id, error = %err, "identify gate unavailable");
                            return Outcome::Retry { resumable: true };
                        }
                    }
                }

                _ = sleep_until(lease_deadline), if ticket.is_some() => {
                    // Lease lapsed before READY: give the turn back, take a new one
                    tracing::warn!(shard = self.id, "identify lease expired before READY");
                    if let Some(ticket) = ticket.take() {
                        ticket.release().await;
                    }
                    self.set_phase(ShardPhase::AwaitingIdentify);
                    *pending = Some(self.spawn_acquire());
                }

                incoming = next_frame(stream, inflater) => {
                    match incoming {
                        Err(err) => return self.fault(err),
                        Ok(Incoming::Closed(code)) => return self.close_outcome(code),
                        Ok(Incoming::Ended) => return Outcome::Retry { resumable: true },
                        Ok(Incoming::Payload(message)) => {
                            match self.handle_message(message, sink, ticket, pending, &mut acked).await {
                                Ok(None) => {}
                                Ok(Some(outcome)) => return outcome,
                                Err(err) => return self.fault(err),
                            }
                        }
                    }
                }
            }
        }
    }

    /// Handle one server payload; `Some` ends the connection attempt
    async fn handle_message(
        &mut self,
        message: GatewayMessage,
        sink: &mut WsSink,
        ticket: &mut Option<IdentifyTicket>,
        pending: &mut Option<TicketTask>,
        acked: &mut bool,
    ) -> ClientResult<Option<Outcome>> {
        match message.op {
            OpCode::Dispatch => self.handle_dispatch(message, ticket).await,

            OpCode::HeartbeatAck => {
                *acked = true;
                Ok(None)
            }

            OpCode::Heartbeat => {
                // The server may request an immediate beat
                send(sink, &GatewayMessage::heartbeat(self.session.seq())).await?;
                Ok(None)
            }

            OpCode::Reconnect => {
                tracing::info!(shard = self.id, "server requested reconnect");
                Ok(Some(Outcome::Retry { resumable: true }))
            }

            OpCode::InvalidSession => {
                let resumable = message.as_invalid_session().unwrap_or(false);
                self.handle_invalid_session(resumable, sink, ticket, pending).await
            }

            op => {
                // Client-only ops arriving from the server are a fault
                Err(ClientError::Protocol(format!(
                    "unexpected op {op} from server"
                )))
            }
        }
    }

    async fn handle_dispatch(
        &mut self,
        message: GatewayMessage,
        ticket: &mut Option<IdentifyTicket>,
    ) -> ClientResult<Option<Outcome>> {
        let Some((name, seq, _)) = message.as_dispatch() else {
            tracing::debug!(shard = self.id, %message, "dispatch missing name or sequence");
            return Ok(None);
        };
        let name = name.to_string();
        self.session.record_seq(seq);

        match EventKind::parse(&name) {
            Some(EventKind::Ready) => {
                let ready: Ready = serde_json::from_value(
                    message.d.clone().unwrap_or(serde_json::Value::Null),
                )
                .map_err(|e| ClientError::Protocol(format!("malformed READY: {e}")))?;
                tracing::info!(
                    shard = self.id,
                    session_id = %ready.session_id,
                    guilds = ready.guilds.len(),
                    "shard ready"
                );
                self.session
                    .open(ready.session_id.clone(), ready.resume_gateway_url.clone());
                // One identify completes before the next begins
                if let Some(ticket) = ticket.take() {
                    ticket.release().await;
                }
                self.protocol_strikes = 0;
                self.backoff.reset();
                self.set_phase(ShardPhase::Active);
            }
            Some(EventKind::Resumed) => {
                tracing::info!(shard = self.id, "session resumed");
                self.protocol_strikes = 0;
                self.backoff.reset();
                self.set_phase(ShardPhase::Active);
            }
            _ => {}
        }

        let delivered = self
            .messages
            .send(ShardMessage::Dispatch {
                shard_id: self.id,
                name,
                seq,
                data: message.d.unwrap_or(serde_json::Value::Null),
            })
            .await;
        if delivered.is_err() {
            // The orchestrator is gone; stop cleanly
            return Ok(Some(Outcome::Shutdown));
        }
        Ok(None)
    }

    async fn handle_invalid_session(
        &mut self,
        resumable: bool,
        sink: &mut WsSink,
        ticket: &mut Option<IdentifyTicket>,
        pending: &mut Option<TicketTask>,
    ) -> ClientResult<Option<Outcome>> {
        let invalid = ClientError::SessionInvalid { resumable };
        tracing::warn!(shard = self.id, error = %invalid, code = invalid.code(), "gateway session invalidated");

        // The service asks for a short desynchronized pause first
        let pause = Duration::from_millis(rand::thread_rng().gen_range(1000..=5000));
        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            () = wait_shutdown(&mut shutdown) => return Ok(Some(Outcome::Shutdown)),
        }

        if resumable && self.phase == ShardPhase::Resuming {
            let Some((session_id, seq)) = self.session.resumable() else {
                // Nothing left to resume with; let the fault policy decide
                return Err(invalid);
            };
            let resume = Resume {
                token: self.token.clone(),
                session_id: session_id.to_string(),
                seq,
            };
            send(sink, &GatewayMessage::resume(&resume)).await?;
            return Ok(None);
        }

        // Not resumable (or we were identifying): start a fresh session
        // under a fresh ticket
        self.session.clear();
        if let Some(ticket) = ticket.take() {
            ticket.release().await;
        }
        self.set_phase(ShardPhase::AwaitingIdentify);
        if pending.is_none() {
            *pending = Some(self.spawn_acquire());
        }
        Ok(None)
    }

    /// Park on the identify gate without blocking the connection
    fn spawn_acquire(&self) -> TicketTask {
        let gate = self.gate.clone();
        tokio::spawn(async move { gate.acquire().await })
    }

    /// Send IDENTIFY under a granted ticket; `Some` ends the attempt
    async fn send_identify(
        &mut self,
        sink: &mut WsSink,
        granted: IdentifyTicket,
        ticket: &mut Option<IdentifyTicket>,
    ) -> Option<Outcome> {
        let identify = Identify {
            token: self.token.clone(),
            properties: IdentifyProperties::default(),
            intents: self.config.intents,
            shard: Some([self.id, self.count]),
            compress: None,
        };
        if let Err(err) = send(sink, &GatewayMessage::identify(&identify)).await {
            granted.release().await;
            return Some(self.fault(err));
        }
        *ticket = Some(granted);
        self.set_phase(ShardPhase::Identifying);
        None
    }

    /// Classify a close code into the next move
    fn close_outcome(&mut self, code: Option<u16>) -> Outcome {
        let Some(raw) = code else {
            return Outcome::Retry { resumable: true };
        };
        tracing::info!(shard = self.id, code = raw, "gateway connection closed");
        match CloseCode::classify(raw) {
            CloseAction::Resume => Outcome::Retry { resumable: true },
            CloseAction::Reidentify => Outcome::Retry { resumable: false },
            CloseAction::Fatal => {
                let error = CloseCode::from_u16(raw)
                    .and_then(CloseCode::fatal_error)
                    .unwrap_or_else(|| {
                        ClientError::Protocol(format!("fatal close code {raw}"))
                    });
                Outcome::Fatal(error)
            }
        }
    }

    /// Turn a transport/protocol failure into the next move
    ///
    /// A protocol fault reconnects as resumable once; a second on the same
    /// session drops the session and re-identifies. An invalidated session
    /// that cannot be re-established in place reconnects per the service's
    /// resumable verdict.
    fn fault(&mut self, err: ClientError) -> Outcome {
        match err {
            ClientError::Protocol(reason) => {
                tracing::warn!(shard = self.id, %reason, "gateway protocol fault");
                self.protocol_strikes += 1;
                if self.protocol_strikes > 1 {
                    self.protocol_strikes = 0;
                    Outcome::Retry { resumable: false }
                } else {
                    Outcome::Retry { resumable: true }
                }
            }
            ClientError::SessionInvalid { resumable } => {
                tracing::warn!(shard = self.id, resumable, "reconnecting after session invalidation");
                Outcome::Retry { resumable }
            }
            err => {
                tracing::warn!(shard = self.id, error = %err, "gateway transport fault");
                Outcome::Retry { resumable: true }
            }
        }
    }

    fn connect_url(&self) -> String {
        let base = self
            .session
            .resume_url()
            .unwrap_or(&self.url)
            .trim_end_matches('/');
        let compress = if self.config.compress {
            "&compress=zlib-stream"
        } else {
            ""
        };
        format!(
            "{base}/?v={}&encoding=json{compress}",
            self.config.api_version
        )
    }

    fn set_phase(&mut self, phase: ShardPhase) {
        if self.phase != phase {
            tracing::debug!(shard = self.id, from = %self.phase, to = %phase, "phase change");
            self.phase = phase;
            let _ = self.phase_tx.send(phase);
        }
    }
}

/// Resolve once shutdown is requested (or the handle is gone)
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Handle dropped: treat as shutdown
            return;
        }
    }
}

/// A deadline that never fires, for disabled select branches
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

/// Await the parked gate acquisition; only called under an `is_some` guard
async fn poll_ticket(
    pending: &mut Option<TicketTask>,
) -> Result<ClientResult<IdentifyTicket>, JoinError> {
    pending.as_mut().expect("guarded by is_some").await
}

fn flatten_ticket(
    joined: Result<ClientResult<IdentifyTicket>, JoinError>,
) -> ClientResult<IdentifyTicket> {
    match joined {
        Ok(result) => result,
        Err(join_err) => Err(ClientError::Internal(format!(
            "identify acquisition task failed: {join_err}"
        ))),
    }
}

async fn send(sink: &mut WsSink, message: &GatewayMessage) -> ClientResult<()> {
    let json = message
        .to_json()
        .map_err(|e| ClientError::Internal(format!("payload serialization failed: {e}")))?;
    sink.send(Message::Text(json))
        .await
        .map_err(ClientError::transport)
}

/// Read frames until one complete gateway payload (or the stream ends)
async fn next_frame(
    stream: &mut WsSource,
    inflater: &mut Option<Inflater>,
) -> ClientResult<Incoming> {
    loop {
        let Some(frame) = stream.next().await else {
            return Ok(Incoming::Ended);
        };
        let frame = frame.map_err(ClientError::transport)?;
        match frame {
            Message::Text(text) => {
                let message = GatewayMessage::from_json(&text)
                    .map_err(|e| ClientError::Protocol(format!("malformed frame: {e}")))?;
                return Ok(Incoming::Payload(message));
            }
            Message::Binary(bytes) => {
                let decoded = match inflater {
                    Some(inflater) => match inflater.push(&bytes)? {
                        Some(decoded) => decoded,
                        // Message still split across frames
                        None => continue,
                    },
                    None => bytes,
                };
                let message = serde_json::from_slice(&decoded)
                    .map_err(|e| ClientError::Protocol(format!("malformed frame: {e}")))?;
                return Ok(Incoming::Payload(message));
            }
            Message::Close(frame) => {
                return Ok(Incoming::Closed(frame.map(|f| u16::from(f.code))));
            }
            // The protocol layer answers pings; nothing to do here
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        }
    }
}
