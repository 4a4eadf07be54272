//! State capture and checksumming

use sha2::{Digest, Sha256};

use crate::protocol::{CriticalDelta, GameStateSnapshot, ProtocolError, ShipSnapshot, UnitSnapshot};
use crate::sim::Simulation;

/// Capture every live entity. Read-only apart from the timestamp.
pub fn capture<S: Simulation>(world: &S, origin_player_id: &str, now: i64) -> GameStateSnapshot {
    let mut units: Vec<UnitSnapshot> = world
        .units()
        .filter(|u| u.is_active())
        .map(|u| u.snapshot())
        .collect();
    units.sort_by(|a, b| a.id.cmp(&b.id));

    let mut ships: Vec<ShipSnapshot> = world.ships().map(|s| s.snapshot()).collect();
    ships.sort_by(|a, b| a.id.cmp(&b.id));

    let checksum = compute_checksum(&units, &ships);
    GameStateSnapshot {
        captured_at: now,
        origin_player_id: origin_player_id.to_string(),
        units,
        ships,
        checksum,
    }
}

/// Hex SHA-256 over rounded entity fields, in id order.
///
/// Positions and health are rounded to whole world units so float noise
/// between two simulations does not read as divergence.
pub fn compute_checksum(units: &[UnitSnapshot], ships: &[ShipSnapshot]) -> String {
    let mut units: Vec<&UnitSnapshot> = units.iter().collect();
    units.sort_by(|a, b| a.id.cmp(&b.id));
    let mut ships: Vec<&ShipSnapshot> = ships.iter().collect();
    ships.sort_by(|a, b| a.id.cmp(&b.id));

    let mut hasher = Sha256::new();
    hasher.update(b"units");
    for unit in units {
        let (x, y) = unit.position.rounded();
        let health = unit.health.round() as i64;
        hasher.update(format!("|{}:{}:{}:{}", unit.id, x, y, health).as_bytes());
    }
    hasher.update(b"ships");
    for ship in ships {
        let (x, y) = ship.position.rounded();
        let cargo: u32 = ship.cargo_counts.values().sum();
        hasher.update(format!("|{}:{}:{}:{}", ship.id, x, y, cargo).as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Check that a received snapshot's checksum matches its contents
pub fn verify(snapshot: &GameStateSnapshot) -> Result<(), ProtocolError> {
    let computed = compute_checksum(&snapshot.units, &snapshot.ships);
    if computed != snapshot.checksum {
        return Err(ProtocolError::ChecksumMismatch {
            carried: snapshot.checksum.clone(),
            computed,
        });
    }
    Ok(())
}

/// Capture only what an incremental sync reports: deaths after
/// `reported_through` and badly wounded units, both restricted to units
/// `origin_player_id` owns
pub fn capture_critical<S: Simulation>(
    world: &S,
    origin_player_id: &str,
    critical_ratio: f32,
    reported_through: u64,
    now: i64,
) -> CriticalDelta {
    let dead_unit_ids = world
        .recent_deaths()
        .iter()
        .filter(|f| f.sequence > reported_through && f.owner_id == origin_player_id)
        .map(|f| f.id.clone())
        .collect();

    let wounded = world
        .units()
        .filter(|u| u.owner_id == origin_player_id && u.is_active())
        .filter(|u| u.health < critical_ratio * u.max_health)
        .map(|u| u.snapshot())
        .collect();

    CriticalDelta {
        captured_at: now,
        origin_player_id: origin_player_id.to_string(),
        dead_unit_ids,
        wounded,
    }
}

/// Sequence of the newest death the world remembers
pub fn last_death<S: Simulation>(world: &S) -> Option<u64> {
    world.recent_deaths().last().map(|f| f.sequence)
}
