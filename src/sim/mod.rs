//! Simulation boundary
//!
//! The engine never reaches into the game's simulation directly. It reads
//! entities and mutates them only through the [`Simulation`] trait: the
//! command verbs (spawn/move/attack/board/raise-flag) and the primitives
//! reconciliation needs. [`World`] is a plain implementation used by hosts
//! without their own simulation and by tests.

pub mod entity;
pub mod formation;
pub mod world;

pub use entity::{FallenUnit, RaisedFlag, Ship, Unit};
pub use formation::{formation_offsets, formation_targets};
pub use world::World;

use crate::protocol::{Position, ShipSnapshot, UnitSnapshot, UnitType};

/// Narrow interface between the sync engine and a simulation
pub trait Simulation: Send + 'static {
    fn unit(&self, id: &str) -> Option<&Unit>;
    fn ship(&self, id: &str) -> Option<&Ship>;
    /// All units, in id order
    fn units(&self) -> impl Iterator<Item = &Unit> + '_;
    /// All ships, in id order
    fn ships(&self) -> impl Iterator<Item = &Ship> + '_;
    /// Bounded list of the most recent deaths, oldest first, with strictly
    /// increasing `sequence`
    fn recent_deaths(&self) -> &[FallenUnit];

    fn spawn_unit(&mut self, unit: Unit);
    fn move_unit(&mut self, unit_id: &str, destination: Position, attack_move: bool);
    fn engage(&mut self, attacker_id: &str, target_id: &str);
    /// Remove a unit as dead and remember it in `recent_deaths`
    fn kill_unit(&mut self, unit_id: &str, reason: &str) -> Option<Unit>;
    fn move_ship(&mut self, ship_id: &str, destination: Position);
    /// Take one unit of `unit_type` out of a ship's cargo
    fn take_cargo(&mut self, ship_id: &str, unit_type: UnitType) -> bool;
    fn board_ship(&mut self, unit_id: &str, ship_id: &str);
    fn raise_flag(&mut self, captain_id: &str, apex: Position);
    fn clear_combat(&mut self, unit_id: &str);

    /// Create or overwrite a unit; returns true when it was created
    fn upsert_unit(&mut self, snapshot: &UnitSnapshot) -> bool;
    /// Drop a unit without recording a death
    fn remove_unit(&mut self, unit_id: &str) -> Option<Unit>;
    /// Create or overwrite a ship; returns true when it was created
    fn upsert_ship(&mut self, snapshot: &ShipSnapshot) -> bool;
    fn remove_ship(&mut self, ship_id: &str) -> Option<Ship>;
}
