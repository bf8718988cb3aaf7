//! Gateway shards
//!
//! One shard is one persistent event-stream connection: a WebSocket, a
//! heartbeat timer, sequence tracking, and the resume/identify decision,
//! driven by a single runner task.

mod backoff;
mod runner;
mod session;

pub use backoff::Backoff;
pub use session::{ShardPhase, ShardSession};

use crate::identify::IdentifyGate;
use quill_common::{ClientError, GatewayConfig};
use runner::Runner;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// What a shard reports to its orchestrator
#[derive(Debug)]
pub(crate) enum ShardMessage {
    /// A dispatched event, in receive order
    Dispatch {
        shard_id: u16,
        name: String,
        seq: u64,
        data: Value,
    },
    /// The shard hit a terminal error and moved to `Dead`
    Fatal { shard_id: u16, error: ClientError },
}

/// Handle to one gateway shard
///
/// The state machine runs in its own task; this handle starts it, watches
/// its phase, and signals shutdown.
pub struct Shard {
    id: u16,
    count: u16,
    phase_rx: watch::Receiver<ShardPhase>,
    start_tx: Option<oneshot::Sender<()>>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Shard {
    /// Create a shard and spawn its (initially idle) runner task
    #[must_use]
    pub(crate) fn new(
        id: u16,
        count: u16,
        token: String,
        url: String,
        config: Arc<GatewayConfig>,
        gate: Arc<IdentifyGate>,
        messages: mpsc::Sender<ShardMessage>,
    ) -> Self {
        let (phase_tx, phase_rx) = watch::channel(ShardPhase::Idle);
        let (start_tx, start_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = Runner::new(
            id, count, token, url, config, gate, phase_tx, messages, shutdown_rx,
        );
        let task = tokio::spawn(runner.run(start_rx));

        Self {
            id,
            count,
            phase_rx,
            start_tx: Some(start_tx),
            shutdown_tx,
            task,
        }
    }

    /// Shard index within the cluster
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Total shard count this shard identifies with
    #[must_use]
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Current connection phase
    #[must_use]
    pub fn phase(&self) -> ShardPhase {
        *self.phase_rx.borrow()
    }

    /// Watch phase transitions
    #[must_use]
    pub fn phase_watch(&self) -> watch::Receiver<ShardPhase> {
        self.phase_rx.clone()
    }

    /// Begin the connection state machine; idempotent after the first call
    pub fn login(&mut self) {
        if let Some(start) = self.start_tx.take() {
            let _ = start.send(());
        }
    }

    /// Ask the shard to drain to `Idle` with no reconnect
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for the runner to finish
    pub async fn join(self) {
        self.shutdown();
        let _ = self.task.await;
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("count", &self.count)
            .field("phase", &self.phase())
            .finish()
    }
}
