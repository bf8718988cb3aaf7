//! Cluster orchestrator
//!
//! Owns the set of shards, the login queue, the startup-completion policy,
//! and the event fan-out to the user sink. Each shard's errors stay
//! contained to that shard; the cluster only ends when every shard is dead
//! or the user drops the event receiver.

use crate::events::{Event, EventKind, SHARD_STARTUP_COMPLETE, STARTUP_COMPLETE};
use crate::identify::{IdentifyGate, RemoteGate};
use crate::protocol::UnavailableGuild;
use crate::shard::{Shard, ShardMessage, ShardPhase};
use quill_common::{normalize_token, ClientConfig, ClientError, ClientResult, GatewayConfig, ShardPlan};
use quill_rest::RestClient;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Cadence of the login loop and the startup-tolerance check
const TICK: Duration = Duration::from_secs(1);

/// A running set of gateway shards
pub struct Cluster {
    shards: Arc<Mutex<Vec<Shard>>>,
    login_task: JoinHandle<()>,
    pump_task: JoinHandle<()>,
    shard_count: u16,
}

impl Cluster {
    /// Plan shards, connect, and hand back the event stream
    ///
    /// The shard plan is resolved in order: environment overrides (already
    /// applied to the config), the programmatic plan, then the service's
    /// recommendation for anything left open.
    pub async fn start(config: ClientConfig) -> ClientResult<(Self, mpsc::Receiver<Event>)> {
        let config = config
            .apply_env()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        let rest = Arc::new(RestClient::new(&config.token, config.rest.clone())?);
        Self::start_with(config, rest, Vec::new()).await
    }

    /// Start with a shared REST client and optional remote identify locks
    pub async fn start_with(
        config: ClientConfig,
        rest: Arc<RestClient>,
        remote_locks: Vec<RemoteGate>,
    ) -> ClientResult<(Self, mpsc::Receiver<Event>)> {
        if config.token.trim().is_empty() {
            return Err(ClientError::Config("missing token".into()));
        }
        config
            .shard_plan
            .validate()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        let (shard_ids, shard_count, url) = resolve_plan(&config, &rest).await?;
        tracing::info!(
            shards = shard_ids.len(),
            shard_count,
            "starting gateway cluster"
        );

        let gateway_config = Arc::new(config.gateway.clone());
        let gate = Arc::new(IdentifyGate::with_remotes(
            gateway_config.identify_gap,
            gateway_config.identify_lease,
            remote_locks,
        ));
        let token = normalize_token(&config.token);

        let (message_tx, message_rx) = mpsc::channel(256);
        let shards: Vec<Shard> = shard_ids
            .iter()
            .map(|id| {
                Shard::new(
                    *id,
                    shard_count,
                    token.clone(),
                    url.clone(),
                    gateway_config.clone(),
                    gate.clone(),
                    message_tx.clone(),
                )
            })
            .collect();
        drop(message_tx);

        let phase_watches: Vec<_> = shards.iter().map(Shard::phase_watch).collect();
        let shards = Arc::new(Mutex::new(shards));

        let login_task = tokio::spawn(login_loop(
            shards.clone(),
            phase_watches,
            gateway_config.identify_guard,
        ));

        let (user_tx, user_rx) = mpsc::channel(1024);
        let pump_task = tokio::spawn(pump(message_rx, user_tx, gateway_config, shard_ids));

        Ok((
            Self {
                shards,
                login_task,
                pump_task,
                shard_count,
            },
            user_rx,
        ))
    }

    /// Total shard count the cluster identifies with
    #[must_use]
    pub fn shard_count(&self) -> u16 {
        self.shard_count
    }

    /// Current phase of every shard
    pub async fn phases(&self) -> Vec<(u16, ShardPhase)> {
        self.shards
            .lock()
            .await
            .iter()
            .map(|s| (s.id(), s.phase()))
            .collect()
    }

    /// Drain every shard to `Idle` and stop the cluster
    pub async fn shutdown(self) {
        self.login_task.abort();
        let shards = {
            let mut guard = self.shards.lock().await;
            std::mem::take(&mut *guard)
        };
        for shard in shards {
            shard.join().await;
        }
        let _ = self.pump_task.await;
        tracing::info!("gateway cluster stopped");
    }
}

/// Resolve `(shard ids, shard count, gateway url)` per the configured plan
async fn resolve_plan(
    config: &ClientConfig,
    rest: &RestClient,
) -> ClientResult<(Vec<u16>, u16, String)> {
    let need_count = matches!(config.shard_plan, ShardPlan::Auto);
    let need_url = config.gateway.url.is_none();

    let recommended = if need_count || need_url {
        Some(rest.get_gateway_bot().await?)
    } else {
        None
    };

    let (ids, count) = match &config.shard_plan {
        ShardPlan::Explicit { ids, count } => (ids.clone(), *count),
        ShardPlan::CountOnly(count) => ((0..*count).collect(), *count),
        ShardPlan::Auto => {
            let count = recommended
                .as_ref()
                .map(|g| g.shards)
                .filter(|count| *count > 0)
                .ok_or_else(|| {
                    ClientError::Config("service recommended zero shards".into())
                })?;
            ((0..count).collect(), count)
        }
    };

    let url = match &config.gateway.url {
        Some(url) => url.clone(),
        None => recommended
            .map(|g| g.url)
            .ok_or_else(|| ClientError::Config("no gateway url available".into()))?,
    };

    Ok((ids, count, url))
}

/// Dequeue one shard per tick, when nothing is mid-handshake
async fn login_loop(
    shards: Arc<Mutex<Vec<Shard>>>,
    phases: Vec<watch::Receiver<ShardPhase>>,
    guard: Duration,
) {
    let guard_over = Instant::now() + guard;
    let mut queue: VecDeque<usize> = (0..phases.len()).collect();
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while let Some(&next) = queue.front() {
        ticker.tick().await;
        if Instant::now() < guard_over {
            continue;
        }
        if phases.iter().any(|w| w.borrow().is_handshaking()) {
            continue;
        }
        queue.pop_front();
        let mut shards = shards.lock().await;
        if let Some(shard) = shards.get_mut(next) {
            tracing::info!(shard = shard.id(), "logging in shard");
            shard.login();
        }
    }
}

/// Per-shard startup window: READY's unavailable guild set drains through
/// suppressed GUILD_CREATEs, with an optional tolerance relaxation
struct ShardStartup {
    pending: HashSet<String>,
    saw_ready: bool,
    complete: bool,
    last_guild_create: Instant,
}

impl ShardStartup {
    fn new() -> Self {
        Self {
            pending: HashSet::new(),
            saw_ready: false,
            complete: false,
            last_guild_create: Instant::now(),
        }
    }
}

/// Startup bookkeeping and suppression for the whole cluster
pub(crate) struct StartupTracker {
    config: Arc<GatewayConfig>,
    shards: HashMap<u16, ShardStartup>,
    started_up: bool,
}

/// What the tracker decided for one incoming dispatch
pub(crate) enum Verdict {
    Forward,
    Suppress,
}

impl StartupTracker {
    pub(crate) fn new(config: Arc<GatewayConfig>, shard_ids: &[u16]) -> Self {
        Self {
            config,
            shards: shard_ids.iter().map(|id| (*id, ShardStartup::new())).collect(),
            started_up: false,
        }
    }

    /// Apply one dispatch; returns the suppression verdict plus any
    /// synthetic completion events to emit
    pub(crate) fn on_dispatch(
        &mut self,
        shard_id: u16,
        name: &str,
        data: &Value,
        now: Instant,
    ) -> (Verdict, Vec<Event>) {
        let Some(state) = self.shards.get_mut(&shard_id) else {
            return (Verdict::Forward, Vec::new());
        };

        match EventKind::parse(name) {
            Some(EventKind::Ready) => {
                let guilds: Vec<UnavailableGuild> = data
                    .get("guilds")
                    .cloned()
                    .and_then(|g| serde_json::from_value(g).ok())
                    .unwrap_or_default();
                state.pending = guilds.into_iter().map(|g| g.id).collect();
                state.saw_ready = true;
                state.complete = false;
                state.last_guild_create = now;
                tracing::debug!(
                    shard = shard_id,
                    unavailable = state.pending.len(),
                    "startup window opened"
                );
                if state.pending.is_empty() {
                    return (Verdict::Forward, self.complete_shard(shard_id));
                }
                (Verdict::Forward, Vec::new())
            }

            // Resume continues an already-tracked session
            Some(EventKind::Resumed) => (Verdict::Forward, Vec::new()),

            Some(EventKind::GuildCreate) if !state.complete => {
                let id = data.get("id").and_then(Value::as_str).unwrap_or_default();
                if state.pending.remove(id) {
                    state.last_guild_create = now;
                    // Part of the initial snapshot: count it, hide it
                    if state.pending.is_empty() {
                        return (Verdict::Suppress, self.complete_shard(shard_id));
                    }
                    return (Verdict::Suppress, Vec::new());
                }
                // A genuinely new guild, even mid-startup
                (Verdict::Forward, Vec::new())
            }

            _ if !state.complete => {
                if self.config.allow_events_during_startup {
                    (Verdict::Forward, Vec::new())
                } else {
                    (Verdict::Suppress, Vec::new())
                }
            }

            _ => (Verdict::Forward, Vec::new()),
        }
    }

    /// Periodic tolerance check; returns synthetic completion events
    pub(crate) fn check_tolerance(&mut self, now: Instant) -> Vec<Event> {
        let Some(tolerance) = self.config.unavailable_guild_tolerance else {
            return Vec::new();
        };
        let wait = self.config.unavailable_guild_wait;

        let stragglers: Vec<u16> = self
            .shards
            .iter()
            .filter(|(_, s)| {
                s.saw_ready
                    && !s.complete
                    && s.pending.len() <= tolerance as usize
                    && now.saturating_duration_since(s.last_guild_create) >= wait
            })
            .map(|(id, _)| *id)
            .collect();

        let mut events = Vec::new();
        for shard_id in stragglers {
            let remaining = self.shards[&shard_id].pending.len();
            tracing::warn!(
                shard = shard_id,
                remaining,
                "forcing startup completion within tolerance"
            );
            events.extend(self.complete_shard(shard_id));
        }
        events
    }

    /// A shard died; it no longer holds up global startup
    pub(crate) fn on_dead(&mut self, shard_id: u16) -> Vec<Event> {
        if let Some(state) = self.shards.get_mut(&shard_id) {
            if !state.complete {
                state.complete = true;
                state.pending.clear();
                return self.global_completion();
            }
        }
        Vec::new()
    }

    /// Whether a shard's ordinary traffic still gets suppressed
    pub(crate) fn is_suppressing(&self, shard_id: u16) -> bool {
        self.shards
            .get(&shard_id)
            .map_or(false, |s| !s.complete)
    }

    fn complete_shard(&mut self, shard_id: u16) -> Vec<Event> {
        let Some(state) = self.shards.get_mut(&shard_id) else {
            return Vec::new();
        };
        state.complete = true;
        state.pending.clear();
        tracing::info!(shard = shard_id, "shard startup complete");

        let mut events = vec![Event::synthetic(
            shard_id,
            SHARD_STARTUP_COMPLETE,
            serde_json::json!({ "shard_id": shard_id }),
        )];
        events.extend(self.global_completion());
        events
    }

    fn global_completion(&mut self) -> Vec<Event> {
        if self.started_up || !self.shards.values().all(|s| s.complete) {
            return Vec::new();
        }
        self.started_up = true;
        tracing::info!("all shards started up");
        vec![Event::synthetic(0, STARTUP_COMPLETE, Value::Null)]
    }
}

/// Fan shard messages out to the user sink, applying startup suppression
async fn pump(
    mut messages: mpsc::Receiver<ShardMessage>,
    user_tx: mpsc::Sender<Event>,
    config: Arc<GatewayConfig>,
    shard_ids: Vec<u16>,
) {
    let total = shard_ids.len();
    let mut tracker = StartupTracker::new(config.clone(), &shard_ids);
    let mut dead: HashSet<u16> = HashSet::new();
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = messages.recv() => {
                let Some(message) = message else {
                    // Every shard task ended
                    return;
                };
                match message {
                    ShardMessage::Dispatch { shard_id, name, seq, data } => {
                        let (verdict, synthetic) =
                            tracker.on_dispatch(shard_id, &name, &data, Instant::now());
                        if let Verdict::Forward = verdict {
                            let event = Event {
                                shard_id,
                                name: remap(&config, name),
                                seq: Some(seq),
                                data,
                            };
                            if user_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        if emit_all(&user_tx, &config, synthetic).await.is_err() {
                            return;
                        }
                    }
                    ShardMessage::Fatal { shard_id, error } => {
                        tracing::error!(shard = shard_id, error = %error, "shard is dead");
                        dead.insert(shard_id);
                        let synthetic = tracker.on_dead(shard_id);
                        if emit_all(&user_tx, &config, synthetic).await.is_err() {
                            return;
                        }
                        if dead.len() == total {
                            tracing::error!("every shard is dead, ending event stream");
                            return;
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                let synthetic = tracker.check_tolerance(Instant::now());
                if emit_all(&user_tx, &config, synthetic).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn remap(config: &GatewayConfig, name: String) -> String {
    config.event_remap.get(&name).cloned().unwrap_or(name)
}

async fn emit_all(
    user_tx: &mpsc::Sender<Event>,
    config: &GatewayConfig,
    events: Vec<Event>,
) -> Result<(), ()> {
    for mut event in events {
        event.name = remap(config, event.name);
        if user_tx.send(event).await.is_err() {
            return Err(());
        }
    }
    Ok(())
}
