//! Session lifecycle: wiring, timers, inbound handling and teardown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::config::SyncConfig;
use crate::protocol::{
    Command, CommandAction, CriticalDelta, Envelope, PingPayload, PongPayload, RecordKind,
    SnapshotRecord,
};
use crate::sim::Simulation;
use crate::transport::{ChannelKind, InboundQueue, LatencyTracker, Transport};
use crate::util::time::unix_millis;

use super::capture::verify;
use super::coordinator::{FullSyncOutcome, SyncCoordinator, SyncTrigger};
use super::dispatcher::CommandDispatcher;
use super::health::HealthReport;
use super::processor::{CommandError, CommandProcessor};
use super::state::{SessionState, SharedState, SyncStats, SyncStatus};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0} channel receiver was already taken")]
    ReceiverTaken(ChannelKind),
}

/// Rolling round-trip samples per channel
#[derive(Debug)]
struct ChannelLatency {
    peer: LatencyTracker,
    log: LatencyTracker,
}

impl ChannelLatency {
    fn new(window: usize) -> Self {
        Self {
            peer: LatencyTracker::new(window),
            log: LatencyTracker::new(window),
        }
    }

    fn tracker(&mut self, kind: ChannelKind) -> &mut LatencyTracker {
        match kind {
            ChannelKind::Peer => &mut self.peer,
            ChannelKind::BroadcastLog => &mut self.log,
        }
    }
}

/// State shared between the session handle and its event loop
struct SessionCore<S> {
    player_id: String,
    state: SharedState<S>,
    dispatcher: Arc<CommandDispatcher>,
    coordinator: Arc<SyncCoordinator<S>>,
    latency: Mutex<ChannelLatency>,
    config: SyncConfig,
}

/// One player's side of a synchronized session.
///
/// `init` takes over both channels and starts the timers; `dispose` (or
/// dropping the session) stops everything. No handler runs after dispose.
pub struct SyncSession<S: Simulation> {
    session_id: String,
    core: Arc<SessionCore<S>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<S: Simulation> SyncSession<S> {
    /// Wire a session over the given channels. Must be called inside a
    /// tokio runtime.
    pub fn init(
        session_id: &str,
        player_id: &str,
        world: S,
        peer: Arc<dyn Transport>,
        log: Arc<dyn Transport>,
        config: SyncConfig,
    ) -> Result<Self, SessionError> {
        let peer_rx = peer
            .take_receiver()
            .ok_or(SessionError::ReceiverTaken(ChannelKind::Peer))?;
        let log_rx = log
            .take_receiver()
            .ok_or(SessionError::ReceiverTaken(ChannelKind::BroadcastLog))?;

        let state = Arc::new(Mutex::new(SessionState::new(player_id, world, &config)));
        let dispatcher = Arc::new(CommandDispatcher::new(player_id, peer, log));
        let coordinator = Arc::new(SyncCoordinator::new(
            state.clone(),
            dispatcher.clone(),
            config.clone(),
        ));
        let core = Arc::new(SessionCore {
            player_id: player_id.to_string(),
            state,
            dispatcher,
            coordinator,
            latency: Mutex::new(ChannelLatency::new(config.latency_window)),
            config,
        });

        core.broadcast(RecordKind::Join);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let span = info_span!("sync_session", session_id, player_id);
        let task = tokio::spawn(run(core.clone(), peer_rx, log_rx, shutdown_rx).instrument(span));

        info!(session_id, player_id, "Sync session started");
        Ok(Self {
            session_id: session_id.to_string(),
            core,
            shutdown,
            task: Mutex::new(Some(task)),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn player_id(&self) -> &str {
        &self.core.player_id
    }

    /// Apply a local action, then send it to the peer
    pub fn issue(&self, action: CommandAction) -> Result<Command, CommandError> {
        let command = self.core.dispatcher.stamp(action);
        CommandProcessor::receive(&mut *self.core.state.lock(), &command)?;
        self.core.dispatcher.dispatch(&command);
        Ok(command)
    }

    /// Read the simulation under the session lock
    pub fn with_world<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.core.state.lock().world)
    }

    /// Mutate the simulation under the session lock (stepping, combat)
    pub fn with_world_mut<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.core.state.lock().world)
    }

    pub fn status(&self) -> SyncStatus {
        self.core.state.lock().status.clone()
    }

    pub fn stats(&self) -> SyncStats {
        self.core.state.lock().stats
    }

    /// Average round trip over the channel's recent samples
    pub fn latency(&self, kind: ChannelKind) -> Option<Duration> {
        self.core.latency.lock().tracker(kind).average()
    }

    /// Run a full sync round now
    pub async fn full_sync(&self) -> FullSyncOutcome {
        self.core.coordinator.full_sync(SyncTrigger::Requested).await
    }

    /// Publish a critical delta now
    pub fn incremental_sync(&self) -> bool {
        self.core.coordinator.incremental_sync()
    }

    /// Run the health scan now
    pub fn health_check(&self) -> HealthReport {
        self.core.coordinator.health_check()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stop timers and in-flight syncs, say goodbye, close both channels.
    /// Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.core.broadcast(RecordKind::Leave);
        self.core.dispatcher.peer().close();
        self.core.dispatcher.log().close();
        info!(session_id = %self.session_id, player_id = %self.core.player_id, "Sync session disposed");
    }
}

impl<S: Simulation> Drop for SyncSession<S> {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn run<S: Simulation>(
    core: Arc<SessionCore<S>>,
    mut peer_rx: InboundQueue,
    mut log_rx: InboundQueue,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut incremental = ticker(core.config.incremental_interval);
    let mut forced_full = ticker(core.config.full_sync_interval);
    let mut health = ticker(core.config.health_interval);
    let mut ping = ticker(core.config.ping_interval);
    let mut syncs: JoinSet<FullSyncOutcome> = JoinSet::new();
    let mut peer_open = true;
    let mut log_open = true;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            received = peer_rx.recv(), if peer_open => match received {
                Some(bytes) => core.handle_inbound(ChannelKind::Peer, &bytes),
                None => {
                    warn!("Peer channel closed, continuing on the log alone");
                    peer_open = false;
                }
            },

            received = log_rx.recv(), if log_open => match received {
                Some(bytes) => core.handle_inbound(ChannelKind::BroadcastLog, &bytes),
                None => {
                    warn!("Log channel closed");
                    log_open = false;
                }
            },

            _ = incremental.tick() => {
                core.coordinator.incremental_sync();
            }

            _ = forced_full.tick() => {
                spawn_full_sync(&core, &mut syncs, SyncTrigger::Scheduled);
            }

            _ = health.tick() => {
                core.coordinator.health_check();
            }

            _ = ping.tick() => core.ping(),

            Some(finished) = syncs.join_next(), if !syncs.is_empty() => {
                if let Err(e) = finished {
                    if !e.is_cancelled() {
                        warn!(error = %e, "Full sync task failed");
                    }
                }
            }
        }

        if core.coordinator.desync_threshold_reached() {
            spawn_full_sync(&core, &mut syncs, SyncTrigger::DesyncThreshold);
        }
    }

    syncs.abort_all();
    debug!("Sync session loop stopped");
}

fn spawn_full_sync<S: Simulation>(
    core: &Arc<SessionCore<S>>,
    syncs: &mut JoinSet<FullSyncOutcome>,
    trigger: SyncTrigger,
) {
    if !syncs.is_empty() {
        return;
    }
    let coordinator = core.coordinator.clone();
    syncs.spawn(async move { coordinator.full_sync(trigger).await }.in_current_span());
}

impl<S: Simulation> SessionCore<S> {
    /// Send a bare record on both channels
    fn broadcast(&self, kind: RecordKind) {
        let envelope = Envelope::bare(kind, &self.player_id);
        for transport in [self.dispatcher.peer(), self.dispatcher.log()] {
            if let Err(e) = self.dispatcher.send_on(transport.as_ref(), &envelope) {
                debug!(channel = %transport.kind(), error = %e, record = ?kind, "Could not send record");
            }
        }
    }

    fn ping(&self) {
        let envelope = match Envelope::new(
            RecordKind::Ping,
            &self.player_id,
            &PingPayload { sent_at: unix_millis() },
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Failed to encode ping");
                return;
            }
        };
        for transport in [self.dispatcher.peer(), self.dispatcher.log()] {
            if let Err(e) = self.dispatcher.send_on(transport.as_ref(), &envelope) {
                trace!(channel = %transport.kind(), error = %e, "Ping not sent");
            }
        }
    }

    fn channel(&self, kind: ChannelKind) -> &Arc<dyn Transport> {
        match kind {
            ChannelKind::Peer => self.dispatcher.peer(),
            ChannelKind::BroadcastLog => self.dispatcher.log(),
        }
    }

    fn malformed(&self, channel: ChannelKind, error: &dyn std::fmt::Display) {
        self.state.lock().stats.malformed += 1;
        warn!(%channel, error = %error, "Dropped malformed record");
    }

    /// Route one inbound record. Never fails: bad input is logged and counted.
    fn handle_inbound(&self, channel: ChannelKind, bytes: &Bytes) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => return self.malformed(channel, &e),
        };

        // Our own records come back on the log
        if envelope.sender_id == self.player_id {
            return;
        }

        match envelope.kind {
            RecordKind::Ping => {
                let Ok(ping) = envelope.payload_as::<PingPayload>() else {
                    return self.malformed(channel, &"ping without sentAt");
                };
                let pong = Envelope::new(
                    RecordKind::Pong,
                    &self.player_id,
                    &PongPayload {
                        original_sent_at: ping.sent_at,
                    },
                );
                let sent = match pong {
                    Ok(pong) => self
                        .dispatcher
                        .send_on(self.channel(channel).as_ref(), &pong)
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                if let Err(e) = sent {
                    trace!(%channel, error = %e, "Pong not sent");
                }
            }
            RecordKind::Pong => match envelope.payload_as::<PongPayload>() {
                Ok(pong) => {
                    let recorded = self
                        .latency
                        .lock()
                        .tracker(channel)
                        .record_pong(pong.original_sent_at, unix_millis());
                    if !recorded {
                        self.malformed(channel, &"pong timestamp out of range");
                    }
                }
                Err(e) => self.malformed(channel, &e),
            },
            RecordKind::Join => info!(%channel, player_id = %envelope.sender_id, "Participant joined"),
            RecordKind::Leave => info!(%channel, player_id = %envelope.sender_id, "Participant left"),
            RecordKind::Command => {
                let command = match envelope.payload_as::<Command>() {
                    Ok(command) => command,
                    Err(e) => return self.malformed(channel, &e),
                };
                // The log authenticates senders; the peer link cannot
                if channel == ChannelKind::BroadcastLog && command.player_id() != envelope.sender_id {
                    let mut state = self.state.lock();
                    state.stats.ownership_rejections += 1;
                    warn!(
                        command_id = %command.id(),
                        claimed = %command.player_id(),
                        sender_id = %envelope.sender_id,
                        "Command sender does not match its player"
                    );
                    return;
                }
                let _ = CommandProcessor::receive(&mut *self.state.lock(), &command);
            }
            RecordKind::Snapshot => {
                let record = match envelope.payload_as::<SnapshotRecord>() {
                    Ok(record) => record,
                    Err(e) => return self.malformed(channel, &e),
                };
                if record.snapshot.origin_player_id != envelope.sender_id {
                    return self.malformed(channel, &"snapshot origin does not match sender");
                }
                if let Err(e) = verify(&record.snapshot) {
                    let mut state = self.state.lock();
                    state.stats.malformed += 1;
                    state.note_desync(1);
                    warn!(%channel, error = %e, "Discarded corrupt peer snapshot");
                    return;
                }
                self.coordinator.on_peer_snapshot(record);
            }
            RecordKind::CriticalDelta => {
                let delta = match envelope.payload_as::<CriticalDelta>() {
                    Ok(delta) => delta,
                    Err(e) => return self.malformed(channel, &e),
                };
                if delta.origin_player_id != envelope.sender_id {
                    return self.malformed(channel, &"delta origin does not match sender");
                }
                self.coordinator.on_peer_delta(&delta);
            }
        }
    }
}
