//! Snapshot wire types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{EntityId, PlayerId, Position, Team, UnitState, UnitType};

/// Unit state in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitSnapshot {
    pub id: EntityId,
    pub owner_id: PlayerId,
    pub team: Team,
    #[serde(rename = "type")]
    pub unit_type: UnitType,
    pub position: Position,
    pub health: f32,
    pub max_health: f32,
    pub state: UnitState,
    /// Enemy currently engaged, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_enemy_id: Option<EntityId>,
    pub in_combat: bool,
    /// Unit is on its way to a ship
    pub boarded: bool,
}

/// Ship state in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipSnapshot {
    pub id: EntityId,
    pub owner_id: PlayerId,
    pub team: Team,
    pub position: Position,
    /// Units carried, by type
    pub cargo_counts: BTreeMap<UnitType, u32>,
}

/// Full, checksummed capture of one peer's simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateSnapshot {
    /// Capturing peer's unix time in milliseconds
    pub captured_at: i64,
    pub origin_player_id: PlayerId,
    /// Live units sorted by id
    pub units: Vec<UnitSnapshot>,
    /// Ships sorted by id
    pub ships: Vec<ShipSnapshot>,
    /// Hex SHA-256 over the canonical entity fields
    pub checksum: String,
}

/// Cheap incremental sync payload: only dead and badly wounded units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalDelta {
    pub captured_at: i64,
    pub origin_player_id: PlayerId,
    /// Recently fallen units owned by the origin player
    pub dead_unit_ids: Vec<EntityId>,
    /// Units below the critical health ratio
    pub wounded: Vec<UnitSnapshot>,
}

impl CriticalDelta {
    pub fn is_empty(&self) -> bool {
        self.dead_unit_ids.is_empty() && self.wounded.is_empty()
    }
}

/// A snapshot published as part of a full sync round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    /// Id of the sync round this snapshot belongs to
    pub sync_id: String,
    /// Receiver should answer with its own snapshot
    pub reply_requested: bool,
    pub snapshot: GameStateSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ship_cargo_serializes_with_unit_type_keys() {
        let ship = ShipSnapshot {
            id: "s1".to_string(),
            owner_id: "blue".to_string(),
            team: Team::Blue,
            position: Position::new(10.0, 20.0),
            cargo_counts: BTreeMap::from([(UnitType::Archer, 2), (UnitType::Captain, 1)]),
        };

        let value = serde_json::to_value(&ship).unwrap();
        assert_eq!(value["cargoCounts"], json!({"archer": 2, "captain": 1}));

        let parsed: ShipSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, ship);
    }

    #[test]
    fn unit_snapshot_omits_missing_target() {
        let unit = UnitSnapshot {
            id: "u1".to_string(),
            owner_id: "blue".to_string(),
            team: Team::Blue,
            unit_type: UnitType::Swordsman,
            position: Position::default(),
            health: 120.0,
            max_health: 120.0,
            state: UnitState::Idle,
            target_enemy_id: None,
            in_combat: false,
            boarded: false,
        };

        let value = serde_json::to_value(&unit).unwrap();
        assert_eq!(value["type"], "swordsman");
        assert!(value.get("targetEnemyId").is_none());
    }
}
