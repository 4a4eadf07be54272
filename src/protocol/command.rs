//! Player commands exchanged between peers

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{EntityId, PlayerId, Position, UnitType};

/// Globally unique command identifier: `{ownerId}_{counter}_{timestamp}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn generate(owner_id: &str, counter: u64, timestamp: i64) -> Self {
        Self(format!("{}_{}_{}", owner_id, counter, timestamp))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommandId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A single player's intended state change.
///
/// Commands are immutable: fields are only readable, and a command is only
/// ever built once by the dispatcher that stamps its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    command_id: CommandId,
    /// Issuing player
    player_id: PlayerId,
    /// Issuer's local unix time in milliseconds
    timestamp: i64,
    #[serde(flatten)]
    action: CommandAction,
}

impl Command {
    pub fn new(command_id: CommandId, player_id: PlayerId, timestamp: i64, action: CommandAction) -> Self {
        Self {
            command_id,
            player_id,
            timestamp,
            action,
        }
    }

    pub fn id(&self) -> &CommandId {
        &self.command_id
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn action(&self) -> &CommandAction {
        &self.action
    }

    /// Id given to the unit created by a spawn or deploy command.
    ///
    /// Derived from the command id so both peers create the same entity.
    pub fn derived_unit_id(&self) -> EntityId {
        format!("{}-u", self.command_id)
    }
}

/// Verb-specific part of a command; entity ids and target values only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "commandType",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum CommandAction {
    /// Move a group of units to a point
    UnitMove {
        unit_ids: Vec<EntityId>,
        target_position: Position,
        is_attack_move: bool,
    },

    /// Land a new unit from a ship at a given point
    UnitSpawn {
        ship_id: EntityId,
        unit_type: UnitType,
        spawn_position: Position,
    },

    /// Order one unit to engage an enemy
    UnitAttack {
        attacker_unit_id: EntityId,
        target_unit_id: EntityId,
        is_player_initiated: bool,
    },

    /// Report the death of a unit
    UnitDeath { unit_id: EntityId, reason: String },

    /// Sail a ship to a point
    ShipMove {
        ship_id: EntityId,
        target_position: Position,
    },

    /// Unload one unit of the given type from a ship's cargo
    ShipDeploy { ship_id: EntityId, unit_type: UnitType },

    /// Send units to a ship to be loaded as cargo
    UnitBoardShip {
        unit_ids: Vec<EntityId>,
        ship_id: EntityId,
    },

    /// Raise the player's flag on a hill apex with a captain
    FlagRaise {
        captain_unit_id: EntityId,
        apex_position: Position,
    },
}

impl CommandAction {
    /// Wire name of the verb, used for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::UnitMove { .. } => "unit_move",
            Self::UnitSpawn { .. } => "unit_spawn",
            Self::UnitAttack { .. } => "unit_attack",
            Self::UnitDeath { .. } => "unit_death",
            Self::ShipMove { .. } => "ship_move",
            Self::ShipDeploy { .. } => "ship_deploy",
            Self::UnitBoardShip { .. } => "unit_board_ship",
            Self::FlagRaise { .. } => "flag_raise",
        }
    }
}
