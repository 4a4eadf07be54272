//! Per-session mutable state shared by every engine component

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::SyncConfig;
use crate::protocol::PlayerId;

use super::dedup::ProcessedIdSet;

/// Where the coordinator is in a sync round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    Capturing,
    Publishing,
    AwaitingPeer,
    Reconciling,
}

/// Sync bookkeeping, one per active session
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    pub last_full_sync_at: Option<Instant>,
    pub sync_in_progress: bool,
    pub desync_count: u32,
    pub phase: SyncPhase,
    /// Completed full syncs, including passive ones answered for the peer
    pub full_syncs: u64,
}

/// Counters for everything the processor saw
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub applied: u64,
    pub duplicates: u64,
    pub ownership_rejections: u64,
    pub illegal: u64,
    pub unknown_entities: u64,
    pub malformed: u64,
    pub reconciliations: u64,
}

/// Everything mutated by receive handlers and timers.
///
/// Lives behind a single lock so a command application and a state capture
/// can never interleave.
pub struct SessionState<S> {
    pub local_player: PlayerId,
    pub world: S,
    pub processed: ProcessedIdSet,
    pub status: SyncStatus,
    pub stats: SyncStats,
    /// Newest own death already published in a critical delta
    pub deaths_reported: u64,
}

impl<S> SessionState<S> {
    pub fn new(local_player: &str, world: S, config: &SyncConfig) -> Self {
        Self {
            local_player: local_player.to_string(),
            world,
            processed: ProcessedIdSet::new(config.dedup_capacity, config.idempotency_window),
            status: SyncStatus::default(),
            stats: SyncStats::default(),
            deaths_reported: 0,
        }
    }

    /// Record a detected divergence
    pub fn note_desync(&mut self, count: u32) {
        self.status.desync_count = self.status.desync_count.saturating_add(count);
    }
}

pub type SharedState<S> = Arc<Mutex<SessionState<S>>>;
