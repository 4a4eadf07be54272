//! Local self-check for impossible entity states

use tracing::warn;

use crate::sim::Simulation;

/// Anomalies found and repaired by one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Units with no health left that were still active
    pub removed: Vec<String>,
    /// Units flagged in combat without a target
    pub orphaned_combat: Vec<String>,
}

impl HealthReport {
    /// Desync signals this scan contributes
    pub fn anomalies(&self) -> u32 {
        (self.removed.len() + self.orphaned_combat.len()) as u32
    }

    pub fn is_clean(&self) -> bool {
        self.removed.is_empty() && self.orphaned_combat.is_empty()
    }
}

/// Scan every unit, removing the dead and clearing stale combat flags.
/// Each repair is reported once; the next scan will not see it again.
pub fn scan<S: Simulation>(world: &mut S) -> HealthReport {
    let mut report = HealthReport::default();

    for unit in world.units() {
        if unit.health <= 0.0 && unit.is_active() {
            report.removed.push(unit.id.clone());
        } else if unit.in_combat && unit.target_enemy_id.is_none() {
            report.orphaned_combat.push(unit.id.clone());
        }
    }

    for id in &report.removed {
        warn!(unit_id = %id, "Unit at zero health was still active");
        world.kill_unit(id, "health_check");
    }
    for id in &report.orphaned_combat {
        warn!(unit_id = %id, "Unit in combat without a target");
        world.clear_combat(id);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Position, Team, UnitType};
    use crate::sim::{Unit, World};

    fn world() -> World {
        let mut world = World::new();
        for id in ["a", "b", "c"] {
            world = world.with_unit(Unit::new(
                id.into(),
                "blue".into(),
                Team::Blue,
                UnitType::Spearman,
                Position::new(0.0, 0.0),
            ));
        }
        world
    }

    #[test]
    fn healthy_world_is_clean() {
        let mut world = world();
        assert!(scan(&mut world).is_clean());
    }

    #[test]
    fn zero_health_unit_is_removed_once() {
        let mut world = world();
        world.unit_mut("a").unwrap().health = 0.0;

        let report = scan(&mut world);
        assert_eq!(report.removed, vec!["a".to_string()]);
        assert_eq!(report.anomalies(), 1);
        assert!(world.unit("a").is_none());
        assert!(scan(&mut world).is_clean());
    }

    #[test]
    fn stale_combat_flag_is_cleared() {
        let mut world = world();
        world.unit_mut("b").unwrap().in_combat = true;
        world.unit_mut("c").unwrap().in_combat = true;
        world.unit_mut("c").unwrap().target_enemy_id = Some("x".into());

        let report = scan(&mut world);
        assert_eq!(report.orphaned_combat, vec!["b".to_string()]);
        assert_eq!(world.unit("b").map(|u| u.in_combat), Some(false));
        assert_eq!(world.unit("c").map(|u| u.in_combat), Some(true));
    }
}
