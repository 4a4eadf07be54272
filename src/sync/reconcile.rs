//! Repairing local state from a peer's snapshot

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::protocol::{CriticalDelta, GameStateSnapshot};
use crate::sim::Simulation;

/// How much of a peer snapshot is treated as truth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileMode {
    /// The peer is authoritative only for entities it owns. Local entities
    /// are never touched, so two peers syncing at the same time converge
    /// instead of swapping states.
    #[default]
    OwnerAuthoritative,
    /// The peer's snapshot overwrites every entity
    PeerOverwrites,
}

impl FromStr for ReconcileMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "owner_authoritative" | "owner" => Ok(Self::OwnerAuthoritative),
            "peer_overwrites" | "peer" => Ok(Self::PeerOverwrites),
            other => Err(format!("unknown reconcile mode: {}", other)),
        }
    }
}

impl fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OwnerAuthoritative => f.write_str("owner_authoritative"),
            Self::PeerOverwrites => f.write_str("peer_overwrites"),
        }
    }
}

/// What a reconciliation changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> usize {
        self.created + self.removed
    }
}

/// Apply `snapshot` to `world` as authoritative within `mode`'s scope.
///
/// In scope entities missing locally are created, present ones overwritten,
/// and local in scope entities absent from the snapshot removed.
pub fn reconcile<S: Simulation>(
    world: &mut S,
    snapshot: &GameStateSnapshot,
    mode: ReconcileMode,
) -> ReconcileReport {
    let peer = snapshot.origin_player_id.as_str();
    let in_scope = |owner_id: &str| match mode {
        ReconcileMode::OwnerAuthoritative => owner_id == peer,
        ReconcileMode::PeerOverwrites => true,
    };

    let mut report = ReconcileReport::default();

    let authoritative_units: HashSet<&str> = snapshot
        .units
        .iter()
        .filter(|u| in_scope(&u.owner_id))
        .map(|u| u.id.as_str())
        .collect();
    let stale_units: Vec<String> = world
        .units()
        .filter(|u| in_scope(&u.owner_id) && !authoritative_units.contains(u.id.as_str()))
        .map(|u| u.id.clone())
        .collect();
    for id in stale_units {
        if world.remove_unit(&id).is_some() {
            debug!(unit_id = %id, "Removed unit absent from peer snapshot");
            report.removed += 1;
        }
    }
    for unit in snapshot.units.iter().filter(|u| in_scope(&u.owner_id)) {
        if world.upsert_unit(unit) {
            debug!(unit_id = %unit.id, "Created unit from peer snapshot");
            report.created += 1;
        } else {
            report.updated += 1;
        }
    }

    let authoritative_ships: HashSet<&str> = snapshot
        .ships
        .iter()
        .filter(|s| in_scope(&s.owner_id))
        .map(|s| s.id.as_str())
        .collect();
    let stale_ships: Vec<String> = world
        .ships()
        .filter(|s| in_scope(&s.owner_id) && !authoritative_ships.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect();
    for id in stale_ships {
        if world.remove_ship(&id).is_some() {
            report.removed += 1;
        }
    }
    for ship in snapshot.ships.iter().filter(|s| in_scope(&s.owner_id)) {
        if world.upsert_ship(ship) {
            report.created += 1;
        } else {
            report.updated += 1;
        }
    }

    report
}

/// Outcome of applying a critical delta
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaReport {
    pub removed: usize,
    pub updated: usize,
    /// Wounded units we have never heard of: a desync signal
    pub missing: usize,
}

/// Apply a peer's incremental delta, trusting it only for units it owns
pub fn apply_critical_delta<S: Simulation>(world: &mut S, delta: &CriticalDelta) -> DeltaReport {
    let origin = delta.origin_player_id.as_str();
    let mut report = DeltaReport::default();

    for id in &delta.dead_unit_ids {
        let owned = world.unit(id).map(|u| u.owner_id == origin).unwrap_or(false);
        if owned && world.kill_unit(id, "peer_reported").is_some() {
            report.removed += 1;
        }
    }

    for wounded in delta.wounded.iter().filter(|u| u.owner_id == origin) {
        let Some(unit) = world.unit(&wounded.id) else {
            report.missing += 1;
            continue;
        };
        if unit.owner_id != origin {
            continue;
        }
        if unit.health != wounded.health {
            let mut patched = unit.snapshot();
            patched.health = wounded.health;
            world.upsert_unit(&patched);
            report.updated += 1;
        }
    }

    report
}
