//! Wire protocol shared by both peers and the relay

pub mod command;
pub mod envelope;
pub mod geometry;
pub mod snapshot;

pub use command::{Command, CommandAction, CommandId};
pub use envelope::{Envelope, PingPayload, PongPayload, ProtocolError, RecordKind};
pub use geometry::{Position, Viewport};
pub use snapshot::{
    CriticalDelta, GameStateSnapshot, ShipSnapshot, SnapshotRecord, UnitSnapshot,
};

use serde::{Deserialize, Serialize};

/// Identifier of a player in a session (e.g. "blue")
pub type PlayerId = String;

/// Identifier of a unit or ship, unique across the whole session
pub type EntityId = String;

/// Unit types that can be spawned or carried as ship cargo
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    /// Front-line melee
    Swordsman,
    /// Ranged, fragile
    Archer,
    /// Anti-charge melee
    Spearman,
    /// Leader; the only unit that can raise a flag
    Captain,
}

impl UnitType {
    pub fn max_health(self) -> f32 {
        match self {
            Self::Swordsman => 120.0,
            Self::Archer => 80.0,
            Self::Spearman => 100.0,
            Self::Captain => 150.0,
        }
    }

    /// Movement speed in world units per second
    pub fn speed(self) -> f32 {
        match self {
            Self::Swordsman => 60.0,
            Self::Archer => 70.0,
            Self::Spearman => 55.0,
            Self::Captain => 65.0,
        }
    }
}

impl Default for UnitType {
    fn default() -> Self {
        Self::Swordsman
    }
}

/// Side a player fights for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Team {
    Blue,
    Red,
}

/// Behavioural state of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Idle,
    Moving,
    /// Moving, engaging anything met on the way
    AttackMoving,
    Attacking,
    /// Walking to a ship to be loaded as cargo
    Boarding,
    RaisingFlag,
    Dead,
}

impl Default for UnitState {
    fn default() -> Self {
        Self::Idle
    }
}
