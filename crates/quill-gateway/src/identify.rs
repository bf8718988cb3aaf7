//! Identify gate
//!
//! Serializes IDENTIFY operations across every shard sharing one gate, and
//! optionally across processes via remote locks. A ticket is held from
//! grant until the shard reaches `Active` or its attempt definitively
//! fails; grants are FIFO and at least `min_gap` apart.

use async_trait::async_trait;
use quill_common::{ClientError, ClientResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

/// How long a refused remote lock waits before asking again
const REMOTE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A granted remote lock lease
#[derive(Debug, Clone)]
pub struct RemoteLease {
    pub token: String,
    /// Milliseconds of lease remaining at grant time
    pub duration_ms: u64,
}

/// Remote identify-lock seam
///
/// Implemented by the broker client; the gate only ever talks to this
/// trait.
#[async_trait]
pub trait IdentifyLock: Send + Sync {
    /// Try to take the lock; `None` when another holder has it
    async fn acquire(&self, duration: Duration) -> ClientResult<Option<RemoteLease>>;

    /// Extend a held lease; false when the lease was lost
    async fn renew(&self, token: &str, duration: Duration) -> ClientResult<bool>;

    /// Release a held lease
    async fn release(&self, token: &str) -> ClientResult<()>;
}

/// One remote lock plus its failure policy
pub struct RemoteGate {
    pub lock: Arc<dyn IdentifyLock>,
    /// Skip this lock on RPC failure instead of surfacing the error
    pub allow_fallback: bool,
}

struct GateState {
    last_identify: Option<Instant>,
}

/// Width-1 serializer of identify operations
pub struct IdentifyGate {
    slot: Arc<Mutex<()>>,
    state: Mutex<GateState>,
    min_gap: Duration,
    lease: Duration,
    remotes: Vec<RemoteGate>,
}

impl IdentifyGate {
    #[must_use]
    pub fn new(min_gap: Duration, lease: Duration) -> Self {
        Self::with_remotes(min_gap, lease, Vec::new())
    }

    /// A gate that must also hold each remote lock, in order
    #[must_use]
    pub fn with_remotes(min_gap: Duration, lease: Duration, remotes: Vec<RemoteGate>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(())),
            state: Mutex::new(GateState { last_identify: None }),
            min_gap,
            lease,
            remotes,
        }
    }

    /// Block until this caller may identify
    ///
    /// Resolves once the local slot is free, the minimum inter-identify gap
    /// has elapsed, and every configured remote lock is held.
    pub async fn acquire(&self) -> ClientResult<IdentifyTicket> {
        // Fair mutex: callers park and wake in arrival order
        let slot = self.slot.clone().lock_owned().await;

        let gap_over = {
            let state = self.state.lock().await;
            state.last_identify.map(|at| at + self.min_gap)
        };
        if let Some(gap_over) = gap_over {
            tokio::time::sleep_until(gap_over).await;
        }

        let mut leases = Vec::new();
        for remote in &self.remotes {
            match self.acquire_remote(remote).await {
                Ok(Some(lease)) => leases.push((remote.lock.clone(), lease)),
                Ok(None) => {}
                Err(err) => {
                    // Undo partial acquisition before surfacing
                    for (lock, lease) in leases {
                        let _ = lock.release(&lease.token).await;
                    }
                    return Err(err);
                }
            }
        }

        self.state.lock().await.last_identify = Some(Instant::now());
        Ok(IdentifyTicket {
            _slot: slot,
            leases,
            expires_at: Instant::now() + self.lease,
        })
    }

    /// Hold one remote lock, retrying while another process has it
    async fn acquire_remote(&self, remote: &RemoteGate) -> ClientResult<Option<RemoteLease>> {
        loop {
            match remote.lock.acquire(self.lease).await {
                Ok(Some(lease)) => return Ok(Some(lease)),
                Ok(None) => tokio::time::sleep(REMOTE_RETRY_DELAY).await,
                Err(err) if remote.allow_fallback => {
                    tracing::warn!(error = %err, "remote identify lock unreachable, proceeding without it");
                    return Ok(None);
                }
                Err(err) => {
                    return Err(ClientError::Rpc(format!("identify lock acquire failed: {err}")))
                }
            }
        }
    }
}

/// A granted identify turn
///
/// Held by the requesting shard until it reaches `Active` or its identify
/// attempt fails; dropping without [`IdentifyTicket::release`] frees the
/// local slot but leaves remote leases to lapse on their own expiry.
pub struct IdentifyTicket {
    _slot: OwnedMutexGuard<()>,
    leases: Vec<(Arc<dyn IdentifyLock>, RemoteLease)>,
    expires_at: Instant,
}

impl IdentifyTicket {
    /// When the lease lapses; past this the holder must re-request
    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Release the turn, including any remote leases
    pub async fn release(self) {
        for (lock, lease) in &self.leases {
            if let Err(err) = lock.release(&lease.token).await {
                tracing::warn!(error = %err, "remote identify lock release failed");
            }
        }
        // The local slot frees when self drops here
    }
}
