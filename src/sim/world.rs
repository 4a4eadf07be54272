//! Reference simulation: entity storage plus a minimal movement step

use std::collections::BTreeMap;

use tracing::debug;

use crate::protocol::{Position, ShipSnapshot, UnitSnapshot, UnitState, UnitType};

use super::{FallenUnit, RaisedFlag, Ship, Simulation, Unit};

/// Ship speed in world units per second
pub const SHIP_SPEED: f32 = 90.0;

/// How close a boarding unit must get to its ship
pub const BOARDING_RADIUS: f32 = 40.0;

/// Deaths remembered for incremental syncs
pub const RECENT_DEATHS_CAPACITY: usize = 64;

/// Entity store. BTreeMaps keep iteration order identical on both peers.
#[derive(Debug, Default, Clone)]
pub struct World {
    units: BTreeMap<String, Unit>,
    ships: BTreeMap<String, Ship>,
    recent_deaths: Vec<FallenUnit>,
    deaths: u64,
    flags: Vec<RaisedFlag>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.units.insert(unit.id.clone(), unit);
        self
    }

    pub fn with_ship(mut self, ship: Ship) -> Self {
        self.ships.insert(ship.id.clone(), ship);
        self
    }

    pub fn unit_mut(&mut self, id: &str) -> Option<&mut Unit> {
        self.units.get_mut(id)
    }

    pub fn ship_mut(&mut self, id: &str) -> Option<&mut Ship> {
        self.ships.get_mut(id)
    }

    pub fn flags(&self) -> &[RaisedFlag] {
        &self.flags
    }

    /// Advance movement by `dt` seconds
    pub fn step(&mut self, dt: f32) {
        for ship in self.ships.values_mut() {
            if let Some(destination) = ship.destination {
                ship.position = ship.position.step_towards(destination, SHIP_SPEED * dt);
                if ship.position == destination {
                    ship.destination = None;
                }
            }
        }

        let mut arrived = Vec::new();
        for unit in self.units.values_mut() {
            if let Some(destination) = unit.destination {
                let speed = unit.unit_type.speed();
                unit.position = unit.position.step_towards(destination, speed * dt);
                if unit.position == destination {
                    unit.destination = None;
                    arrived.push(unit.id.clone());
                }
            }
        }

        for id in arrived {
            self.on_arrival(&id);
        }
    }

    fn on_arrival(&mut self, unit_id: &str) {
        let Some(unit) = self.units.get(unit_id) else {
            return;
        };

        match unit.state {
            UnitState::Boarding => {
                let position = unit.position;
                let owner = unit.owner_id.clone();
                let unit_type = unit.unit_type;
                let ship = self.ships.values_mut().find(|s| {
                    s.owner_id == owner && s.position.distance(position) <= BOARDING_RADIUS
                });
                match ship {
                    Some(ship) => {
                        *ship.cargo.entry(unit_type).or_insert(0) += 1;
                        debug!(unit_id = %unit_id, ship_id = %ship.id, "Unit boarded ship");
                        self.units.remove(unit_id);
                    }
                    None => {
                        if let Some(unit) = self.units.get_mut(unit_id) {
                            unit.boarded = false;
                            unit.state = UnitState::Idle;
                        }
                    }
                }
            }
            UnitState::RaisingFlag => {
                self.flags.push(RaisedFlag {
                    owner_id: unit.owner_id.clone(),
                    captain_id: unit.id.clone(),
                    position: unit.position,
                });
                if let Some(unit) = self.units.get_mut(unit_id) {
                    unit.state = UnitState::Idle;
                }
            }
            UnitState::Moving | UnitState::AttackMoving => {
                if let Some(unit) = self.units.get_mut(unit_id) {
                    unit.state = UnitState::Idle;
                }
            }
            _ => {}
        }
    }
}

impl Simulation for World {
    fn unit(&self, id: &str) -> Option<&Unit> {
        self.units.get(id)
    }

    fn ship(&self, id: &str) -> Option<&Ship> {
        self.ships.get(id)
    }

    fn units(&self) -> impl Iterator<Item = &Unit> + '_ {
        self.units.values()
    }

    fn ships(&self) -> impl Iterator<Item = &Ship> + '_ {
        self.ships.values()
    }

    fn recent_deaths(&self) -> &[FallenUnit] {
        &self.recent_deaths
    }

    fn spawn_unit(&mut self, unit: Unit) {
        self.units.insert(unit.id.clone(), unit);
    }

    fn move_unit(&mut self, unit_id: &str, destination: Position, attack_move: bool) {
        if let Some(unit) = self.units.get_mut(unit_id) {
            unit.destination = Some(destination);
            unit.state = if attack_move {
                UnitState::AttackMoving
            } else {
                UnitState::Moving
            };
            unit.target_enemy_id = None;
            unit.in_combat = false;
            unit.boarded = false;
        }
    }

    fn engage(&mut self, attacker_id: &str, target_id: &str) {
        if let Some(unit) = self.units.get_mut(attacker_id) {
            unit.target_enemy_id = Some(target_id.to_string());
            unit.in_combat = true;
            unit.state = UnitState::Attacking;
            unit.destination = None;
        }
    }

    fn kill_unit(&mut self, unit_id: &str, reason: &str) -> Option<Unit> {
        let mut unit = self.units.remove(unit_id)?;
        unit.health = 0.0;
        unit.state = UnitState::Dead;
        debug!(unit_id = %unit_id, reason, "Unit died");

        // Anyone targeting the dead unit drops out of combat
        for other in self.units.values_mut() {
            if other.target_enemy_id.as_deref() == Some(unit_id) {
                other.target_enemy_id = None;
                other.in_combat = false;
                if other.state == UnitState::Attacking {
                    other.state = UnitState::Idle;
                }
            }
        }

        if self.recent_deaths.len() >= RECENT_DEATHS_CAPACITY {
            self.recent_deaths.remove(0);
        }
        self.deaths += 1;
        self.recent_deaths.push(FallenUnit {
            id: unit.id.clone(),
            owner_id: unit.owner_id.clone(),
            sequence: self.deaths,
        });
        Some(unit)
    }

    fn move_ship(&mut self, ship_id: &str, destination: Position) {
        if let Some(ship) = self.ships.get_mut(ship_id) {
            ship.destination = Some(destination);
        }
    }

    fn take_cargo(&mut self, ship_id: &str, unit_type: UnitType) -> bool {
        let Some(ship) = self.ships.get_mut(ship_id) else {
            return false;
        };
        match ship.cargo.get_mut(&unit_type) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }

    fn board_ship(&mut self, unit_id: &str, ship_id: &str) {
        let Some(ship_position) = self.ships.get(ship_id).map(|s| s.position) else {
            return;
        };
        if let Some(unit) = self.units.get_mut(unit_id) {
            unit.destination = Some(ship_position);
            unit.state = UnitState::Boarding;
            unit.boarded = true;
            unit.target_enemy_id = None;
            unit.in_combat = false;
        }
    }

    fn raise_flag(&mut self, captain_id: &str, apex: Position) {
        if let Some(unit) = self.units.get_mut(captain_id) {
            unit.destination = Some(apex);
            unit.state = UnitState::RaisingFlag;
            unit.target_enemy_id = None;
            unit.in_combat = false;
        }
    }

    fn clear_combat(&mut self, unit_id: &str) {
        if let Some(unit) = self.units.get_mut(unit_id) {
            unit.in_combat = false;
            if unit.state == UnitState::Attacking {
                unit.state = UnitState::Idle;
            }
        }
    }

    fn upsert_unit(&mut self, snapshot: &UnitSnapshot) -> bool {
        match self.units.get_mut(&snapshot.id) {
            Some(unit) => {
                unit.apply_snapshot(snapshot);
                false
            }
            None => {
                self.units
                    .insert(snapshot.id.clone(), Unit::from_snapshot(snapshot));
                true
            }
        }
    }

    fn remove_unit(&mut self, unit_id: &str) -> Option<Unit> {
        self.units.remove(unit_id)
    }

    fn upsert_ship(&mut self, snapshot: &ShipSnapshot) -> bool {
        match self.ships.get_mut(&snapshot.id) {
            Some(ship) => {
                ship.apply_snapshot(snapshot);
                false
            }
            None => {
                self.ships
                    .insert(snapshot.id.clone(), Ship::from_snapshot(snapshot));
                true
            }
        }
    }

    fn remove_ship(&mut self, ship_id: &str) -> Option<Ship> {
        self.ships.remove(ship_id)
    }
}
