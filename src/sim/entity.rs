//! Live entities held by the simulation

use std::collections::BTreeMap;

use crate::protocol::{
    EntityId, PlayerId, Position, ShipSnapshot, Team, UnitSnapshot, UnitState, UnitType,
};

/// A land unit
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub id: EntityId,
    pub owner_id: PlayerId,
    pub team: Team,
    pub unit_type: UnitType,
    pub position: Position,
    /// Where the unit is walking to, if anywhere
    pub destination: Option<Position>,
    pub health: f32,
    pub max_health: f32,
    pub state: UnitState,
    pub target_enemy_id: Option<EntityId>,
    pub in_combat: bool,
    pub boarded: bool,
}

impl Unit {
    pub fn new(
        id: EntityId,
        owner_id: PlayerId,
        team: Team,
        unit_type: UnitType,
        position: Position,
    ) -> Self {
        let max_health = unit_type.max_health();
        Self {
            id,
            owner_id,
            team,
            unit_type,
            position,
            destination: None,
            health: max_health,
            max_health,
            state: UnitState::Idle,
            target_enemy_id: None,
            in_combat: false,
            boarded: false,
        }
    }

    pub fn from_snapshot(snapshot: &UnitSnapshot) -> Self {
        let mut unit = Self::new(
            snapshot.id.clone(),
            snapshot.owner_id.clone(),
            snapshot.team,
            snapshot.unit_type,
            snapshot.position,
        );
        unit.apply_snapshot(snapshot);
        unit
    }

    /// Overwrite the mutable fields from an authoritative snapshot.
    /// Identity (id, owner, team, type) is never changed.
    pub fn apply_snapshot(&mut self, snapshot: &UnitSnapshot) {
        self.position = snapshot.position;
        self.health = snapshot.health;
        self.max_health = snapshot.max_health;
        self.state = snapshot.state;
        self.target_enemy_id = snapshot.target_enemy_id.clone();
        self.in_combat = snapshot.in_combat;
        self.boarded = snapshot.boarded;
        if self.state == UnitState::Idle {
            self.destination = None;
        }
    }

    pub fn snapshot(&self) -> UnitSnapshot {
        UnitSnapshot {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            team: self.team,
            unit_type: self.unit_type,
            position: self.position,
            health: self.health,
            max_health: self.max_health,
            state: self.state,
            target_enemy_id: self.target_enemy_id.clone(),
            in_combat: self.in_combat,
            boarded: self.boarded,
        }
    }

    /// Still part of the fight (not flagged dead)
    pub fn is_active(&self) -> bool {
        self.state != UnitState::Dead
    }
}

/// A ship carrying units as cargo
#[derive(Debug, Clone, PartialEq)]
pub struct Ship {
    pub id: EntityId,
    pub owner_id: PlayerId,
    pub team: Team,
    pub position: Position,
    pub destination: Option<Position>,
    pub cargo: BTreeMap<UnitType, u32>,
}

impl Ship {
    pub fn new(id: EntityId, owner_id: PlayerId, team: Team, position: Position) -> Self {
        Self {
            id,
            owner_id,
            team,
            position,
            destination: None,
            cargo: BTreeMap::new(),
        }
    }

    pub fn with_cargo(mut self, unit_type: UnitType, count: u32) -> Self {
        self.cargo.insert(unit_type, count);
        self
    }

    pub fn from_snapshot(snapshot: &ShipSnapshot) -> Self {
        let mut ship = Self::new(
            snapshot.id.clone(),
            snapshot.owner_id.clone(),
            snapshot.team,
            snapshot.position,
        );
        ship.apply_snapshot(snapshot);
        ship
    }

    /// Ships only take position and cargo from a snapshot
    pub fn apply_snapshot(&mut self, snapshot: &ShipSnapshot) {
        self.position = snapshot.position;
        self.cargo = snapshot.cargo_counts.clone();
    }

    pub fn snapshot(&self) -> ShipSnapshot {
        ShipSnapshot {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            team: self.team,
            position: self.position,
            cargo_counts: self.cargo.clone(),
        }
    }

    pub fn cargo_total(&self) -> u32 {
        self.cargo.values().sum()
    }
}

/// A unit that recently died, kept so incremental syncs can report it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallenUnit {
    pub id: EntityId,
    pub owner_id: PlayerId,
    /// Increases with every death in the same world
    pub sequence: u64,
}

/// A flag planted on a hill apex
#[derive(Debug, Clone, PartialEq)]
pub struct RaisedFlag {
    pub owner_id: PlayerId,
    pub captain_id: EntityId,
    pub position: Position,
}
