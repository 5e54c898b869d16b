//! Default ability set, creator draft sessions, and loadout handling.

use shared::abilities::{
    resolve_profiles, validate_against_budget, AbilityCategory, AbilityDefinition, MeleeProfile,
    ProjectileKind, ProjectileProfile, StatBlock, TierBudget,
};
use shared::protocol::{AbilityCreatorCommand, AbilityCreatorState};

/// Ability ids granted to every fresh account.
pub fn default_ability_ids() -> Vec<u16> {
    vec![1, 2]
}

/// The built-in ability definitions every map instance knows.
pub fn default_abilities() -> Vec<AbilityDefinition> {
    vec![
        AbilityDefinition {
            id: 1,
            name: "Bolt".into(),
            category: AbilityCategory::Projectile,
            stats: StatBlock {
                power: 80,
                velocity: 60,
                efficiency: 40,
                control: 20,
            },
            attributes: 0,
            projectile: Some(ProjectileProfile {
                kind: ProjectileKind::Bolt,
                speed: 20.0,
                damage: 15,
                radius: 0.15,
                cooldown: 0.5,
                lifetime: 3.0,
                range: 40.0,
                spawn_offset: [0.2, 0.1, 0.6],
                gravity: 2.0,
                drag: 0.02,
                max_speed: 60.0,
                min_speed: 0.5,
                pierces: 0,
                despawn_on_damageable_hit: true,
                despawn_on_world_hit: true,
            }),
            melee: None,
        },
        AbilityDefinition {
            id: 2,
            name: "Strike".into(),
            category: AbilityCategory::Melee,
            stats: StatBlock {
                power: 90,
                velocity: 30,
                efficiency: 50,
                control: 30,
            },
            attributes: 0,
            projectile: None,
            melee: Some(MeleeProfile {
                damage: 20,
                radius: 0.5,
                cooldown: 0.6,
                range: 2.0,
                arc_degrees: 90.0,
            }),
        },
    ]
}

/// Server-authoritative creator draft for one connection.
///
/// The client sends field-at-a-time apply commands; every applied (or
/// rejected) command is answered with the canonical
/// `AbilityCreatorState` snapshot.
pub struct CreatorSession {
    draft: AbilityDefinition,
    tier: TierBudget,
    open: bool,
    last_error: Option<String>,
}

/// Outcome of a creator command worth acting on outside the session.
pub enum CreatorOutcome {
    /// Nothing beyond a state re-broadcast.
    StateChanged,
    /// Draft passed submit validation; caller assigns the id and unlocks.
    Submitted(AbilityDefinition),
}

impl Default for CreatorSession {
    fn default() -> Self {
        Self::new(TierBudget::default())
    }
}

impl CreatorSession {
    pub fn new(tier: TierBudget) -> Self {
        Self {
            draft: AbilityDefinition::draft(),
            tier,
            open: false,
            last_error: None,
        }
    }

    pub fn state(&self) -> AbilityCreatorState {
        AbilityCreatorState {
            open: self.open,
            draft: self.draft.clone(),
            points_spent: self.draft.stats.total(),
            points_budget: self.tier.total_points,
            error: self.last_error.clone(),
        }
    }

    /// Applies one command. Mutations that would break the budget leave
    /// the draft untouched and surface the rejection in the next state.
    pub fn apply(&mut self, command: AbilityCreatorCommand) -> CreatorOutcome {
        self.last_error = None;
        match command {
            AbilityCreatorCommand::Open => {
                self.draft = AbilityDefinition::draft();
                self.open = true;
            }
            AbilityCreatorCommand::Cancel => {
                self.draft = AbilityDefinition::draft();
                self.open = false;
            }
            AbilityCreatorCommand::SetName(name) => {
                if self.open {
                    self.draft.name = name.chars().take(32).collect();
                }
            }
            AbilityCreatorCommand::SetCategory(category) => {
                if self.open {
                    self.draft.category = category;
                }
            }
            AbilityCreatorCommand::SetStat { stat, value } => {
                if self.open {
                    let mut candidate = self.draft.clone();
                    candidate.stats.set(stat, value);
                    match validate_against_budget(&candidate, &self.tier, false) {
                        Ok(()) => self.draft = candidate,
                        Err(e) => self.last_error = Some(e.to_string()),
                    }
                }
            }
            AbilityCreatorCommand::ToggleAttribute { bit } => {
                if self.open && bit < 32 {
                    let mut candidate = self.draft.clone();
                    candidate.attributes ^= 1 << bit;
                    match validate_against_budget(&candidate, &self.tier, false) {
                        Ok(()) => self.draft = candidate,
                        Err(e) => self.last_error = Some(e.to_string()),
                    }
                }
            }
            AbilityCreatorCommand::Submit => {
                if self.open {
                    match validate_against_budget(&self.draft, &self.tier, true) {
                        Ok(()) => {
                            let mut def = self.draft.clone();
                            resolve_profiles(&mut def);
                            self.draft = AbilityDefinition::draft();
                            self.open = false;
                            return CreatorOutcome::Submitted(def);
                        }
                        Err(e) => self.last_error = Some(e.to_string()),
                    }
                }
            }
        }
        CreatorOutcome::StateChanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::abilities::StatKind;

    #[test]
    fn test_default_abilities_cover_defaults() {
        let defs = default_abilities();
        let ids: Vec<u16> = defs.iter().map(|d| d.id).collect();
        for id in default_ability_ids() {
            assert!(ids.contains(&id));
        }
        assert!(defs[0].projectile.is_some());
        assert!(defs[1].melee.is_some());
    }

    #[test]
    fn test_creator_open_set_submit() {
        let mut session = CreatorSession::default();
        session.apply(AbilityCreatorCommand::Open);
        session.apply(AbilityCreatorCommand::SetName("Ember".into()));
        session.apply(AbilityCreatorCommand::SetCategory(AbilityCategory::Projectile));
        session.apply(AbilityCreatorCommand::SetStat {
            stat: StatKind::Power,
            value: 100,
        });
        session.apply(AbilityCreatorCommand::SetStat {
            stat: StatKind::Velocity,
            value: 50,
        });

        match session.apply(AbilityCreatorCommand::Submit) {
            CreatorOutcome::Submitted(def) => {
                assert_eq!(def.name, "Ember");
                assert!(def.projectile.is_some());
            }
            CreatorOutcome::StateChanged => panic!("submit should succeed"),
        }
        assert!(!session.state().open);
    }

    #[test]
    fn test_over_budget_stat_rejected() {
        let mut session = CreatorSession::default();
        session.apply(AbilityCreatorCommand::Open);
        session.apply(AbilityCreatorCommand::SetStat {
            stat: StatKind::Power,
            value: 255,
        });
        // 255 alone exceeds the default 200-point budget.
        let state = session.state();
        assert_eq!(state.draft.stats.power, 0);
        assert!(state.error.is_some());
    }

    #[test]
    fn test_submit_without_name_rejected() {
        let mut session = CreatorSession::default();
        session.apply(AbilityCreatorCommand::Open);
        match session.apply(AbilityCreatorCommand::Submit) {
            CreatorOutcome::Submitted(_) => panic!("nameless draft must not submit"),
            CreatorOutcome::StateChanged => {}
        }
        assert!(session.state().error.is_some());
        assert!(session.state().open);
    }

    #[test]
    fn test_commands_ignored_while_closed() {
        let mut session = CreatorSession::default();
        session.apply(AbilityCreatorCommand::SetName("ghost".into()));
        assert!(session.state().draft.name.is_empty());
    }

    #[test]
    fn test_attribute_slot_enforcement() {
        let mut session = CreatorSession::default();
        session.apply(AbilityCreatorCommand::Open);
        session.apply(AbilityCreatorCommand::ToggleAttribute { bit: 0 });
        session.apply(AbilityCreatorCommand::ToggleAttribute { bit: 1 });
        session.apply(AbilityCreatorCommand::ToggleAttribute { bit: 2 });
        // Third upside exceeds the default two slots.
        let state = session.state();
        assert_eq!(state.draft.attributes.count_ones(), 2);
        assert!(state.error.is_some());
    }
}
