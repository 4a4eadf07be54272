//! Incremental and full sync rounds
//!
//! A full sync publishes this peer's snapshot on the log channel, waits a
//! bounded time for any peer snapshot received after that publish, and
//! reconciles when the checksums differ. Whatever happens, the round ends
//! with the desync counter reset and `last_full_sync_at` updated; a round
//! that never heard back leaves the counter at one.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::protocol::{CriticalDelta, GameStateSnapshot, RecordKind, SnapshotRecord};
use crate::sim::Simulation;
use crate::util::time::unix_millis;

use super::capture::{capture, capture_critical, last_death};
use super::dispatcher::{CommandDispatcher, DispatchError};
use super::health::{scan, HealthReport};
use super::reconcile::{apply_critical_delta, reconcile, ReconcileMode, ReconcileReport};
use super::state::{SharedState, SyncPhase};

/// A verified peer snapshot and when it arrived
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub received_at: Instant,
    pub snapshot: Arc<GameStateSnapshot>,
}

/// Why a full sync started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Scheduled,
    DesyncThreshold,
    Requested,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => f.write_str("scheduled"),
            Self::DesyncThreshold => f.write_str("desync_threshold"),
            Self::Requested => f.write_str("requested"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to publish snapshot: {0}")]
    Publish(#[from] DispatchError),

    #[error("no peer snapshot within {0:?}")]
    PeerTimeout(Duration),
}

/// How a full sync round ended
#[derive(Debug)]
pub enum FullSyncOutcome {
    /// Checksums matched
    InSync,
    Reconciled(ReconcileReport),
    /// Another round was already running
    Skipped,
    Failed(SyncError),
}

/// Drives sync rounds against the shared session state
pub struct SyncCoordinator<S> {
    state: SharedState<S>,
    dispatcher: Arc<CommandDispatcher>,
    peer_snapshots: watch::Sender<Option<PeerSnapshot>>,
    config: SyncConfig,
}

impl<S: Simulation> SyncCoordinator<S> {
    pub fn new(state: SharedState<S>, dispatcher: Arc<CommandDispatcher>, config: SyncConfig) -> Self {
        let (peer_snapshots, _) = watch::channel(None);
        Self {
            state,
            dispatcher,
            peer_snapshots,
            config,
        }
    }

    fn player_id(&self) -> &str {
        self.dispatcher.player_id()
    }

    /// Publish a critical delta unless a full sync is running.
    /// Returns whether anything was published.
    pub fn incremental_sync(&self) -> bool {
        let (delta, newest_death) = {
            let state = self.state.lock();
            if state.status.sync_in_progress {
                debug!("Skipping incremental sync during full sync");
                return false;
            }
            let delta = capture_critical(
                &state.world,
                self.player_id(),
                self.config.critical_health_ratio,
                state.deaths_reported,
                unix_millis(),
            );
            (delta, last_death(&state.world))
        };

        if delta.is_empty() {
            return false;
        }

        match self.dispatcher.publish(RecordKind::CriticalDelta, &delta) {
            Ok(()) => {
                if let Some(newest) = newest_death {
                    let mut state = self.state.lock();
                    state.deaths_reported = state.deaths_reported.max(newest);
                }
                debug!(
                    dead = delta.dead_unit_ids.len(),
                    wounded = delta.wounded.len(),
                    "Published critical delta"
                );
                true
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.note_desync(1);
                warn!(error = %e, "Failed to publish critical delta");
                false
            }
        }
    }

    /// Run one full sync round
    pub async fn full_sync(&self, trigger: SyncTrigger) -> FullSyncOutcome {
        let (snapshot, _guard) = {
            let mut state = self.state.lock();
            if state.status.sync_in_progress {
                return FullSyncOutcome::Skipped;
            }
            state.status.sync_in_progress = true;
            state.status.phase = SyncPhase::Capturing;
            let snapshot = capture(&state.world, self.player_id(), unix_millis());
            state.status.phase = SyncPhase::Publishing;
            (snapshot, InProgress { state: self.state.clone() })
        };

        info!(
            %trigger,
            units = snapshot.units.len(),
            checksum = %snapshot.checksum,
            "Starting full sync"
        );

        let mut peer_rx = self.peer_snapshots.subscribe();
        let published_at = Instant::now();
        let record = SnapshotRecord {
            sync_id: Uuid::new_v4().to_string(),
            reply_requested: true,
            snapshot,
        };
        if let Err(e) = self.dispatcher.publish(RecordKind::Snapshot, &record) {
            self.finish(true);
            warn!(error = %e, "Full sync could not publish");
            return FullSyncOutcome::Failed(e.into());
        }

        self.state.lock().status.phase = SyncPhase::AwaitingPeer;
        let timeout = self.config.peer_snapshot_timeout;
        let Some(peer) = wait_for_peer(&mut peer_rx, published_at, timeout).await else {
            self.finish(true);
            warn!(timeout_ms = timeout.as_millis() as u64, "Peer snapshot never arrived");
            return FullSyncOutcome::Failed(SyncError::PeerTimeout(timeout));
        };

        let outcome = if peer.snapshot.checksum == record.snapshot.checksum {
            FullSyncOutcome::InSync
        } else {
            let mut state = self.state.lock();
            state.status.phase = SyncPhase::Reconciling;
            let report = reconcile(&mut state.world, &peer.snapshot, self.config.reconcile_mode);
            state.stats.reconciliations += 1;
            FullSyncOutcome::Reconciled(report)
        };

        self.finish(false);
        match &outcome {
            FullSyncOutcome::Reconciled(report) => info!(
                created = report.created,
                updated = report.updated,
                removed = report.removed,
                "Full sync reconciled"
            ),
            _ => info!("Full sync found peers in agreement"),
        }
        outcome
    }

    /// Close a round: it always counts, even when it failed
    fn finish(&self, unanswered: bool) {
        let mut state = self.state.lock();
        state.status.desync_count = if unanswered { 1 } else { 0 };
        state.status.last_full_sync_at = Some(Instant::now());
        state.status.full_syncs += 1;
    }

    /// Handle a verified snapshot published by the peer
    pub fn on_peer_snapshot(&self, record: SnapshotRecord) {
        let snapshot = Arc::new(record.snapshot);
        self.peer_snapshots.send_replace(Some(PeerSnapshot {
            received_at: Instant::now(),
            snapshot: snapshot.clone(),
        }));

        let reply = {
            let mut state = self.state.lock();
            let reply = record
                .reply_requested
                .then(|| capture(&state.world, self.player_id(), unix_millis()));

            // A running round picks the snapshot up itself. When snapshots
            // overwrite wholesale, only the initiator reconciles: it adopts
            // our reply.
            let passive = !state.status.sync_in_progress
                && !(record.reply_requested
                    && self.config.reconcile_mode == ReconcileMode::PeerOverwrites);
            if passive {
                let local = reply
                    .as_ref()
                    .map(|s| s.checksum.clone())
                    .unwrap_or_else(|| capture(&state.world, self.player_id(), unix_millis()).checksum);
                if local != snapshot.checksum {
                    let report = reconcile(&mut state.world, &snapshot, self.config.reconcile_mode);
                    state.stats.reconciliations += 1;
                    info!(
                        sync_id = %record.sync_id,
                        created = report.created,
                        updated = report.updated,
                        removed = report.removed,
                        "Reconciled from peer snapshot"
                    );
                }
            }
            if record.reply_requested && !state.status.sync_in_progress {
                state.status.desync_count = 0;
                state.status.last_full_sync_at = Some(Instant::now());
                state.status.full_syncs += 1;
            }
            reply
        };

        if let Some(snapshot) = reply {
            let answer = SnapshotRecord {
                sync_id: record.sync_id,
                reply_requested: false,
                snapshot,
            };
            if let Err(e) = self.dispatcher.publish(RecordKind::Snapshot, &answer) {
                warn!(error = %e, "Failed to answer peer snapshot");
            }
        }
    }

    /// Apply a peer's critical delta; unknown wounded units count as desync
    pub fn on_peer_delta(&self, delta: &CriticalDelta) {
        let mut state = self.state.lock();
        let report = apply_critical_delta(&mut state.world, delta);
        if report.missing > 0 {
            state.note_desync(report.missing as u32);
            warn!(
                missing = report.missing,
                desync_count = state.status.desync_count,
                "Peer reported wounded units we do not have"
            );
        }
        debug!(removed = report.removed, updated = report.updated, "Applied critical delta");
    }

    /// Local self-check
    pub fn health_check(&self) -> HealthReport {
        let mut state = self.state.lock();
        let report = scan(&mut state.world);
        if !report.is_clean() {
            state.note_desync(report.anomalies());
        }
        report
    }

    pub fn desync_threshold_reached(&self) -> bool {
        let state = self.state.lock();
        !state.status.sync_in_progress
            && state.status.desync_count >= self.config.desync_threshold
    }
}

/// Clears the in-progress flag however the round ends, including cancellation
struct InProgress<S> {
    state: SharedState<S>,
}

impl<S> Drop for InProgress<S> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.status.sync_in_progress = false;
        state.status.phase = SyncPhase::Idle;
    }
}

async fn wait_for_peer(
    rx: &mut watch::Receiver<Option<PeerSnapshot>>,
    after: Instant,
    timeout: Duration,
) -> Option<PeerSnapshot> {
    let fresh = |seen: &Option<PeerSnapshot>| {
        seen.as_ref()
            .map(|p| p.received_at >= after)
            .unwrap_or(false)
    };
    match tokio::time::timeout(timeout, rx.wait_for(fresh)).await {
        Ok(Ok(seen)) => seen.clone(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    use crate::protocol::{Envelope, Position, Team, UnitType};
    use crate::relay::log::SessionLog;
    use crate::sim::{Unit, World};
    use crate::sync::state::SessionState;
    use crate::transport::{MemoryLogChannel, MemoryPeerChannel};

    struct Fixture {
        coordinator: SyncCoordinator<World>,
        state: SharedState<World>,
        log: Arc<SessionLog>,
        _peer: MemoryPeerChannel,
    }

    fn fixture(world: World, timeout: Duration) -> Fixture {
        fixture_with(
            world,
            SyncConfig {
                peer_snapshot_timeout: timeout,
                ..SyncConfig::default()
            },
        )
    }

    fn fixture_with(world: World, config: SyncConfig) -> Fixture {
        let log = Arc::new(SessionLog::new("room", 100));
        let (peer, remote) = MemoryPeerChannel::pair(8);
        let channel = MemoryLogChannel::join(log.clone(), "blue", 8);
        let dispatcher = Arc::new(CommandDispatcher::new("blue", Arc::new(peer), Arc::new(channel)));
        let state = Arc::new(Mutex::new(SessionState::new("blue", world, &config)));
        Fixture {
            coordinator: SyncCoordinator::new(state.clone(), dispatcher, config),
            state,
            log,
            _peer: remote,
        }
    }

    fn unit(id: &str, owner: &str, x: f32) -> Unit {
        let team = if owner == "blue" { Team::Blue } else { Team::Red };
        Unit::new(id.into(), owner.into(), team, UnitType::Archer, Position::new(x, 0.0))
    }

    #[tokio::test]
    async fn unanswered_full_sync_leaves_one_desync() {
        let f = fixture(World::new(), Duration::from_millis(50));
        f.state.lock().status.desync_count = 5;

        let outcome = f.coordinator.full_sync(SyncTrigger::DesyncThreshold).await;
        assert!(matches!(outcome, FullSyncOutcome::Failed(SyncError::PeerTimeout(_))));

        let state = f.state.lock();
        assert_eq!(state.status.desync_count, 1);
        assert!(!state.status.sync_in_progress);
        assert!(state.status.last_full_sync_at.is_some());
        assert_eq!(state.status.phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn full_sync_reconciles_with_late_peer_answer() {
        let f = fixture(World::new().with_unit(unit("r1", "red", 10.0)), Duration::from_secs(2));
        let red_world = World::new().with_unit(unit("r1", "red", 400.0));

        let answer = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            // the round published its snapshot on the log
            let published = Envelope::decode(&f.log.replay_since(0)[0].1).unwrap();
            let record: SnapshotRecord = published.payload_as().unwrap();
            assert!(record.reply_requested);
            f.coordinator.on_peer_snapshot(SnapshotRecord {
                sync_id: record.sync_id,
                reply_requested: false,
                snapshot: capture(&red_world, "red", 0),
            });
        };
        let (outcome, _) = tokio::join!(f.coordinator.full_sync(SyncTrigger::Requested), answer);

        assert!(matches!(outcome, FullSyncOutcome::Reconciled(r) if r.updated == 1));
        let state = f.state.lock();
        assert_eq!(state.world.unit("r1").map(|u| u.position.x), Some(400.0));
        assert_eq!(state.status.desync_count, 0);
        assert_eq!(state.stats.reconciliations, 1);
    }

    #[tokio::test]
    async fn concurrent_full_sync_is_skipped() {
        let f = fixture(World::new(), Duration::from_millis(50));
        let (first, second) = tokio::join!(
            f.coordinator.full_sync(SyncTrigger::Scheduled),
            f.coordinator.full_sync(SyncTrigger::Scheduled)
        );
        assert!(matches!(first, FullSyncOutcome::Failed(_)));
        assert!(matches!(second, FullSyncOutcome::Skipped));
        assert_eq!(f.state.lock().status.full_syncs, 1);
    }

    #[tokio::test]
    async fn snapshot_request_is_answered_and_reconciled() {
        let f = fixture(World::new().with_unit(unit("b1", "blue", 1.0)), Duration::from_secs(1));
        let red_world = World::new()
            .with_unit(unit("b1", "blue", 1.0))
            .with_unit(unit("r1", "red", 50.0));
        f.state.lock().status.desync_count = 2;

        f.coordinator.on_peer_snapshot(SnapshotRecord {
            sync_id: "round".into(),
            reply_requested: true,
            snapshot: capture(&red_world, "red", 0),
        });

        let answer = Envelope::decode(&f.log.replay_since(0)[0].1).unwrap();
        let record: SnapshotRecord = answer.payload_as().unwrap();
        assert_eq!(record.sync_id, "round");
        assert!(!record.reply_requested);

        let state = f.state.lock();
        assert!(state.world.unit("r1").is_some());
        assert_eq!(state.status.desync_count, 0);
    }

    #[tokio::test]
    async fn overwrite_mode_answers_without_adopting_the_request() {
        let config = SyncConfig {
            reconcile_mode: ReconcileMode::PeerOverwrites,
            ..SyncConfig::default()
        };
        let f = fixture_with(World::new().with_unit(unit("b1", "blue", 1.0)), config);
        let red_world = World::new().with_unit(unit("b1", "blue", 300.0));

        f.coordinator.on_peer_snapshot(SnapshotRecord {
            sync_id: "round".into(),
            reply_requested: true,
            snapshot: capture(&red_world, "red", 0),
        });

        // our reply carries our own state, and we keep it
        let answer = Envelope::decode(&f.log.replay_since(0)[0].1).unwrap();
        let record: SnapshotRecord = answer.payload_as().unwrap();
        assert_eq!(record.snapshot.units[0].position.x, 1.0);
        let state = f.state.lock();
        assert_eq!(state.world.unit("b1").map(|u| u.position.x), Some(1.0));
        assert_eq!(state.stats.reconciliations, 0);
    }

    #[tokio::test]
    async fn incremental_sync_skips_empty_delta_and_publishes_wounds() {
        let f = fixture(World::new().with_unit(unit("b1", "blue", 0.0)), Duration::from_secs(1));
        assert!(!f.coordinator.incremental_sync());
        assert!(f.log.is_empty());

        f.state.lock().world.unit_mut("b1").unwrap().health = 5.0;
        assert!(f.coordinator.incremental_sync());
        let published = Envelope::decode(&f.log.replay_since(0)[0].1).unwrap();
        assert_eq!(published.kind, RecordKind::CriticalDelta);
    }

    #[tokio::test]
    async fn own_death_is_published_once() {
        let world = World::new()
            .with_unit(unit("b1", "blue", 0.0))
            .with_unit(unit("b2", "blue", 0.0));
        let f = fixture(world, Duration::from_secs(1));
        f.state.lock().world.kill_unit("b1", "combat");

        assert!(f.coordinator.incremental_sync());
        let published = Envelope::decode(&f.log.replay_since(0)[0].1).unwrap();
        let delta: CriticalDelta = published.payload_as().unwrap();
        assert_eq!(delta.dead_unit_ids, vec!["b1".to_string()]);

        // nothing new since the last publish
        assert!(!f.coordinator.incremental_sync());
        assert_eq!(f.log.len(), 1);

        f.state.lock().world.kill_unit("b2", "combat");
        assert!(f.coordinator.incremental_sync());
        let published = Envelope::decode(&f.log.replay_since(1)[0].1).unwrap();
        let delta: CriticalDelta = published.payload_as().unwrap();
        assert_eq!(delta.dead_unit_ids, vec!["b2".to_string()]);
    }

    #[tokio::test]
    async fn incremental_sync_waits_for_full_sync() {
        let f = fixture(World::new().with_unit(unit("b1", "blue", 0.0)), Duration::from_secs(1));
        f.state.lock().world.unit_mut("b1").unwrap().health = 5.0;
        f.state.lock().status.sync_in_progress = true;
        assert!(!f.coordinator.incremental_sync());
    }

    #[tokio::test]
    async fn health_anomalies_feed_desync_threshold() {
        let world = World::new()
            .with_unit(unit("b1", "blue", 0.0))
            .with_unit(unit("b2", "blue", 0.0))
            .with_unit(unit("b3", "blue", 0.0));
        let f = fixture(world, Duration::from_secs(1));
        {
            let mut state = f.state.lock();
            state.world.unit_mut("b1").unwrap().health = 0.0;
            state.world.unit_mut("b2").unwrap().in_combat = true;
            state.world.unit_mut("b3").unwrap().health = -3.0;
        }

        let report = f.coordinator.health_check();
        assert_eq!(report.anomalies(), 3);
        assert!(f.coordinator.desync_threshold_reached());
    }
}
