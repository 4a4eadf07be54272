//! Command deduplication, validation and application

use tracing::{debug, trace, warn};

use crate::protocol::{Command, CommandAction, CommandId, UnitType};
use crate::sim::{formation_targets, Ship, Simulation, Unit};

use super::state::SessionState;

/// Why a command was not applied
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("command {0} was already applied")]
    Duplicate(CommandId),

    #[error("command {command_id}: {player_id} does not own {entity_id} (owned by {owner_id})")]
    OwnershipViolation {
        command_id: CommandId,
        player_id: String,
        entity_id: String,
        owner_id: String,
    },

    #[error("command {command_id}: entity {entity_id} does not exist locally")]
    UnknownEntity {
        command_id: CommandId,
        entity_id: String,
    },

    #[error("command {command_id} is illegal: {reason}")]
    Illegal {
        command_id: CommandId,
        reason: String,
    },
}

/// Applies commands to the simulation at most once each
pub struct CommandProcessor;

impl CommandProcessor {
    /// Handle a command from either channel (or issued locally).
    ///
    /// Never fails past this point: every rejection is logged and counted,
    /// and a missing entity feeds the desync counter.
    pub fn receive<S: Simulation>(
        state: &mut SessionState<S>,
        command: &Command,
    ) -> Result<(), CommandError> {
        let result = Self::apply(state, command);
        match &result {
            Ok(()) => {
                state.stats.applied += 1;
                debug!(
                    command_id = %command.id(),
                    command_type = command.action().name(),
                    player_id = %command.player_id(),
                    "Applied command"
                );
            }
            Err(CommandError::Duplicate(id)) => {
                state.stats.duplicates += 1;
                trace!(command_id = %id, "Discarded duplicate command");
            }
            Err(e @ CommandError::OwnershipViolation { .. }) => {
                state.stats.ownership_rejections += 1;
                warn!(error = %e, "Rejected command");
            }
            Err(e @ CommandError::Illegal { .. }) => {
                state.stats.illegal += 1;
                warn!(error = %e, "Rejected command");
            }
            Err(e @ CommandError::UnknownEntity { .. }) => {
                state.stats.unknown_entities += 1;
                state.note_desync(1);
                warn!(
                    error = %e,
                    desync_count = state.status.desync_count,
                    "Command references unknown entity"
                );
            }
        }
        result
    }

    /// Dedup, validate, remember, then mutate
    pub fn apply<S: Simulation>(
        state: &mut SessionState<S>,
        command: &Command,
    ) -> Result<(), CommandError> {
        if state.processed.contains(command.id()) {
            return Err(CommandError::Duplicate(command.id().clone()));
        }

        Self::validate(&state.world, command)?;
        state.processed.insert(command.id().clone());
        Self::execute(&mut state.world, command);
        Ok(())
    }

    /// Check ownership and legality without touching anything
    pub fn validate<S: Simulation>(world: &S, command: &Command) -> Result<(), CommandError> {
        let check = Check { world, command };

        match command.action() {
            CommandAction::UnitMove { unit_ids, .. } => {
                check.non_empty(unit_ids)?;
                for id in unit_ids {
                    check.owned_unit(id)?;
                }
            }
            CommandAction::UnitSpawn { ship_id, .. } => {
                check.owned_ship(ship_id)?;
            }
            CommandAction::UnitAttack {
                attacker_unit_id,
                target_unit_id,
                ..
            } => {
                check.owned_unit(attacker_unit_id)?;
                let target = check.unit(target_unit_id)?;
                if target.owner_id == command.player_id() {
                    return Err(check.illegal("cannot attack a friendly unit"));
                }
            }
            CommandAction::UnitDeath { unit_id, .. } => {
                // Already gone locally is fine: both peers may see the same death
                if world.unit(unit_id).is_some() {
                    check.owned_unit(unit_id)?;
                }
            }
            CommandAction::ShipMove { ship_id, .. } => {
                check.owned_ship(ship_id)?;
            }
            CommandAction::ShipDeploy { ship_id, unit_type } => {
                let ship = check.owned_ship(ship_id)?;
                if ship.cargo.get(unit_type).copied().unwrap_or(0) == 0 {
                    return Err(check.illegal(&format!("ship {} carries no {:?}", ship_id, unit_type)));
                }
            }
            CommandAction::UnitBoardShip { unit_ids, ship_id } => {
                check.non_empty(unit_ids)?;
                check.owned_ship(ship_id)?;
                for id in unit_ids {
                    check.owned_unit(id)?;
                }
            }
            CommandAction::FlagRaise {
                captain_unit_id, ..
            } => {
                let captain = check.owned_unit(captain_unit_id)?;
                if captain.unit_type != UnitType::Captain {
                    return Err(check.illegal("only a captain can raise a flag"));
                }
            }
        }
        Ok(())
    }

    /// Mutate the simulation for an already validated command
    fn execute<S: Simulation>(world: &mut S, command: &Command) {
        match command.action() {
            CommandAction::UnitMove {
                unit_ids,
                target_position,
                is_attack_move,
            } => {
                let targets = formation_targets(*target_position, unit_ids.len());
                for (id, destination) in unit_ids.iter().zip(targets) {
                    world.move_unit(id, destination, *is_attack_move);
                }
            }
            CommandAction::UnitSpawn {
                ship_id,
                unit_type,
                spawn_position,
            } => {
                if let Some(team) = world.ship(ship_id).map(|s| s.team) {
                    world.spawn_unit(Unit::new(
                        command.derived_unit_id(),
                        command.player_id().to_string(),
                        team,
                        *unit_type,
                        *spawn_position,
                    ));
                }
            }
            CommandAction::UnitAttack {
                attacker_unit_id,
                target_unit_id,
                ..
            } => {
                world.engage(attacker_unit_id, target_unit_id);
            }
            CommandAction::UnitDeath { unit_id, reason } => {
                world.kill_unit(unit_id, reason);
            }
            CommandAction::ShipMove {
                ship_id,
                target_position,
            } => {
                world.move_ship(ship_id, *target_position);
            }
            CommandAction::ShipDeploy { ship_id, unit_type } => {
                let Some((team, position)) = world.ship(ship_id).map(|s| (s.team, s.position)) else {
                    return;
                };
                if world.take_cargo(ship_id, *unit_type) {
                    world.spawn_unit(Unit::new(
                        command.derived_unit_id(),
                        command.player_id().to_string(),
                        team,
                        *unit_type,
                        position,
                    ));
                }
            }
            CommandAction::UnitBoardShip { unit_ids, ship_id } => {
                for id in unit_ids {
                    world.board_ship(id, ship_id);
                }
            }
            CommandAction::FlagRaise {
                captain_unit_id,
                apex_position,
            } => {
                world.raise_flag(captain_unit_id, *apex_position);
            }
        }
    }
}

struct Check<'a, S> {
    world: &'a S,
    command: &'a Command,
}

impl<'a, S: Simulation> Check<'a, S> {
    fn unit(&self, id: &str) -> Result<&'a Unit, CommandError> {
        self.world.unit(id).ok_or_else(|| self.unknown(id))
    }

    fn owned_unit(&self, id: &str) -> Result<&'a Unit, CommandError> {
        let unit = self.unit(id)?;
        self.owned(id, &unit.owner_id)?;
        Ok(unit)
    }

    fn owned_ship(&self, id: &str) -> Result<&'a Ship, CommandError> {
        let ship = self.world.ship(id).ok_or_else(|| self.unknown(id))?;
        self.owned(id, &ship.owner_id)?;
        Ok(ship)
    }

    fn owned(&self, entity_id: &str, owner_id: &str) -> Result<(), CommandError> {
        if owner_id == self.command.player_id() {
            return Ok(());
        }
        Err(CommandError::OwnershipViolation {
            command_id: self.command.id().clone(),
            player_id: self.command.player_id().to_string(),
            entity_id: entity_id.to_string(),
            owner_id: owner_id.to_string(),
        })
    }

    fn non_empty(&self, ids: &[String]) -> Result<(), CommandError> {
        if ids.is_empty() {
            return Err(self.illegal("no units selected"));
        }
        Ok(())
    }

    fn unknown(&self, entity_id: &str) -> CommandError {
        CommandError::UnknownEntity {
            command_id: self.command.id().clone(),
            entity_id: entity_id.to_string(),
        }
    }

    fn illegal(&self, reason: &str) -> CommandError {
        CommandError::Illegal {
            command_id: self.command.id().clone(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::protocol::{Position, Team, UnitState};
    use crate::sim::World;

    fn unit(id: &str, owner: &str, team: Team, unit_type: UnitType) -> Unit {
        Unit::new(id.into(), owner.into(), team, unit_type, Position::new(0.0, 0.0))
    }

    fn state() -> SessionState<World> {
        let ship = Ship::new("s1".into(), "blue".into(), Team::Blue, Position::new(500.0, 500.0))
            .with_cargo(UnitType::Archer, 2);
        let world = World::new()
            .with_unit(unit("u1", "blue", Team::Blue, UnitType::Swordsman))
            .with_unit(unit("u2", "blue", Team::Blue, UnitType::Archer))
            .with_unit(unit("c1", "blue", Team::Blue, UnitType::Captain))
            .with_unit(unit("r1", "red", Team::Red, UnitType::Spearman))
            .with_ship(ship);
        SessionState::new("red", world, &SyncConfig::default())
    }

    fn command(id: &str, player: &str, action: CommandAction) -> Command {
        Command::new(CommandId::from(id), player.to_string(), 0, action)
    }

    fn move_u1(id: &str, player: &str) -> Command {
        command(
            id,
            player,
            CommandAction::UnitMove {
                unit_ids: vec!["u1".to_string()],
                target_position: Position::new(100.0, 50.0),
                is_attack_move: false,
            },
        )
    }

    #[test]
    fn move_sets_target_position() {
        let mut state = state();
        CommandProcessor::receive(&mut state, &move_u1("blue_1_0", "blue")).unwrap();

        let u1 = state.world.unit("u1").unwrap();
        assert_eq!(u1.destination, Some(Position::new(100.0, 50.0)));
        assert_eq!(u1.state, UnitState::Moving);
        assert_eq!(state.stats.applied, 1);
    }

    #[test]
    fn redelivery_is_idempotent() {
        let mut state = state();
        let cmd = move_u1("blue_1_0", "blue");
        CommandProcessor::receive(&mut state, &cmd).unwrap();
        let after_once = state.world.unit("u1").cloned();

        // Simulation progresses, then the log channel redelivers
        state.world.step(0.5);
        let progressed = state.world.unit("u1").cloned();
        for _ in 0..3 {
            assert_eq!(
                CommandProcessor::receive(&mut state, &cmd),
                Err(CommandError::Duplicate(cmd.id().clone()))
            );
        }

        assert_eq!(state.world.unit("u1").cloned(), progressed);
        assert_ne!(after_once, progressed);
        assert_eq!(state.stats.applied, 1);
        assert_eq!(state.stats.duplicates, 3);
    }

    #[test]
    fn move_of_foreign_unit_is_rejected_without_mutation() {
        let mut state = state();
        let before = state.world.unit("u1").cloned();

        let result = CommandProcessor::receive(&mut state, &move_u1("red_1_0", "red"));
        assert!(matches!(result, Err(CommandError::OwnershipViolation { .. })));
        assert_eq!(state.world.unit("u1").cloned(), before);
        assert_eq!(state.status.desync_count, 0);
        assert!(!state.processed.contains(&CommandId::from("red_1_0")));
    }

    #[test]
    fn attack_on_missing_target_counts_a_desync() {
        let mut state = state();
        let cmd = command(
            "blue_2_0",
            "blue",
            CommandAction::UnitAttack {
                attacker_unit_id: "u1".into(),
                target_unit_id: "u9".into(),
                is_player_initiated: true,
            },
        );

        let result = CommandProcessor::receive(&mut state, &cmd);
        assert!(matches!(result, Err(CommandError::UnknownEntity { ref entity_id, .. }) if entity_id == "u9"));
        assert_eq!(state.status.desync_count, 1);
        assert_eq!(state.world.unit("u1").map(|u| u.in_combat), Some(false));
    }

    #[test]
    fn attack_sets_target_reference() {
        let mut state = state();
        let cmd = command(
            "blue_3_0",
            "blue",
            CommandAction::UnitAttack {
                attacker_unit_id: "u1".into(),
                target_unit_id: "r1".into(),
                is_player_initiated: true,
            },
        );
        CommandProcessor::receive(&mut state, &cmd).unwrap();

        let u1 = state.world.unit("u1").unwrap();
        assert_eq!(u1.target_enemy_id.as_deref(), Some("r1"));
        assert!(u1.in_combat);
    }

    #[test]
    fn deploy_from_foreign_ship_leaves_cargo_alone() {
        let mut state = state();
        let cmd = command(
            "red_4_0",
            "red",
            CommandAction::ShipDeploy {
                ship_id: "s1".into(),
                unit_type: UnitType::Archer,
            },
        );

        let result = CommandProcessor::receive(&mut state, &cmd);
        assert!(matches!(result, Err(CommandError::OwnershipViolation { .. })));
        assert_eq!(state.world.ship("s1").map(|s| s.cargo_total()), Some(2));
    }

    #[test]
    fn deploy_creates_unit_with_derived_id() {
        let mut state = state();
        let cmd = command(
            "blue_5_0",
            "blue",
            CommandAction::ShipDeploy {
                ship_id: "s1".into(),
                unit_type: UnitType::Archer,
            },
        );
        CommandProcessor::receive(&mut state, &cmd).unwrap();

        let deployed = state.world.unit("blue_5_0-u").unwrap();
        assert_eq!(deployed.unit_type, UnitType::Archer);
        assert_eq!(deployed.position, Position::new(500.0, 500.0));
        assert_eq!(state.world.ship("s1").map(|s| s.cargo_total()), Some(1));
    }

    #[test]
    fn deploy_without_cargo_is_illegal() {
        let mut state = state();
        let cmd = command(
            "blue_6_0",
            "blue",
            CommandAction::ShipDeploy {
                ship_id: "s1".into(),
                unit_type: UnitType::Captain,
            },
        );
        let result = CommandProcessor::receive(&mut state, &cmd);
        assert!(matches!(result, Err(CommandError::Illegal { .. })));
        assert_eq!(state.status.desync_count, 0);
    }

    #[test]
    fn group_move_is_validated_atomically() {
        let mut state = state();
        let cmd = command(
            "blue_7_0",
            "blue",
            CommandAction::UnitMove {
                unit_ids: vec!["u1".into(), "r1".into()],
                target_position: Position::new(10.0, 10.0),
                is_attack_move: true,
            },
        );
        assert!(CommandProcessor::receive(&mut state, &cmd).is_err());
        assert_eq!(state.world.unit("u1").and_then(|u| u.destination), None);
    }

    #[test]
    fn death_of_already_dead_unit_is_benign() {
        let mut state = state();
        state.world.kill_unit("u2", "combat");
        let cmd = command(
            "blue_8_0",
            "blue",
            CommandAction::UnitDeath {
                unit_id: "u2".into(),
                reason: "combat".into(),
            },
        );
        assert!(CommandProcessor::receive(&mut state, &cmd).is_ok());
        assert_eq!(state.status.desync_count, 0);
    }

    #[test]
    fn only_captains_raise_flags() {
        let mut state = state();
        let by_swordsman = command(
            "blue_9_0",
            "blue",
            CommandAction::FlagRaise {
                captain_unit_id: "u1".into(),
                apex_position: Position::new(300.0, 300.0),
            },
        );
        assert!(matches!(
            CommandProcessor::receive(&mut state, &by_swordsman),
            Err(CommandError::Illegal { .. })
        ));

        let by_captain = command(
            "blue_10_0",
            "blue",
            CommandAction::FlagRaise {
                captain_unit_id: "c1".into(),
                apex_position: Position::new(300.0, 300.0),
            },
        );
        CommandProcessor::receive(&mut state, &by_captain).unwrap();
        assert_eq!(
            state.world.unit("c1").map(|u| u.state),
            Some(UnitState::RaisingFlag)
        );
    }

    #[test]
    fn boarding_requires_owning_the_ship() {
        let mut state = state();
        let cmd = command(
            "red_11_0",
            "red",
            CommandAction::UnitBoardShip {
                unit_ids: vec!["r1".into()],
                ship_id: "s1".into(),
            },
        );
        assert!(matches!(
            CommandProcessor::receive(&mut state, &cmd),
            Err(CommandError::OwnershipViolation { .. })
        ));
        assert_eq!(state.world.unit("r1").map(|u| u.boarded), Some(false));
    }
}
