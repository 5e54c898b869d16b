//! Ability data model and creator budget validation.
//!
//! Ability definitions are data: four stat points, an attribute bitmask
//! and optional projectile/melee profiles. The server-side creator
//! validates drafts against a tier budget with a pure function so the
//! same rules can be unit-tested without a session.

use serde::{Deserialize, Serialize};

/// Low 16 attribute bits are upsides, high 16 are downsides.
pub const UPSIDE_BITS: u32 = 0x0000_FFFF;
pub const DOWNSIDE_BITS: u32 = 0xFFFF_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbilityCategory {
    Projectile,
    Melee,
    Beam,
    Aoe,
    Buff,
    Movement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatKind {
    Power,
    Velocity,
    Efficiency,
    Control,
}

/// The four creator-assignable stat points, each 0..255.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatBlock {
    pub power: u8,
    pub velocity: u8,
    pub efficiency: u8,
    pub control: u8,
}

impl StatBlock {
    pub fn total(&self) -> u16 {
        self.power as u16 + self.velocity as u16 + self.efficiency as u16 + self.control as u16
    }

    pub fn set(&mut self, stat: StatKind, value: u8) {
        match stat {
            StatKind::Power => self.power = value,
            StatKind::Velocity => self.velocity = value,
            StatKind::Efficiency => self.efficiency = value,
            StatKind::Control => self.control = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectileKind {
    Bolt,
    Orb,
    Shard,
}

/// Projectile behavior parameters resolved at fire time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectileProfile {
    pub kind: ProjectileKind,
    pub speed: f32,
    pub damage: i32,
    pub radius: f32,
    pub cooldown: f32,
    pub lifetime: f32,
    pub range: f32,
    /// Spawn offset in the caster's view frame (right, up, forward).
    pub spawn_offset: [f32; 3],
    pub gravity: f32,
    pub drag: f32,
    pub max_speed: f32,
    pub min_speed: f32,
    pub pierces: u8,
    pub despawn_on_damageable_hit: bool,
    pub despawn_on_world_hit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeleeProfile {
    pub damage: i32,
    pub radius: f32,
    pub cooldown: f32,
    pub range: f32,
    pub arc_degrees: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbilityDefinition {
    pub id: u16,
    pub name: String,
    pub category: AbilityCategory,
    pub stats: StatBlock,
    pub attributes: u32,
    pub projectile: Option<ProjectileProfile>,
    pub melee: Option<MeleeProfile>,
}

impl AbilityDefinition {
    /// Empty draft used when a creator session opens.
    pub fn draft() -> Self {
        Self {
            id: 0,
            name: String::new(),
            category: AbilityCategory::Projectile,
            stats: StatBlock::default(),
            attributes: 0,
            projectile: None,
            melee: None,
        }
    }

    pub fn upside_count(&self) -> u32 {
        (self.attributes & UPSIDE_BITS).count_ones()
    }

    pub fn downside_count(&self) -> u32 {
        (self.attributes & DOWNSIDE_BITS).count_ones()
    }
}

/// Budget limits for the creator tier a player is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBudget {
    pub total_points: u16,
    pub upside_slots: u8,
    pub downside_max: u8,
}

impl Default for TierBudget {
    fn default() -> Self {
        Self {
            total_points: 200,
            upside_slots: 2,
            downside_max: 2,
        }
    }
}

/// Why a creator draft was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetError {
    OverBudget { spent: u16, budget: u16 },
    TooManyUpsides { used: u32, allowed: u8 },
    TooManyDownsides { used: u32, allowed: u8 },
    EmptyName,
}

impl std::fmt::Display for BudgetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetError::OverBudget { spent, budget } => {
                write!(f, "stat points {spent} exceed budget {budget}")
            }
            BudgetError::TooManyUpsides { used, allowed } => {
                write!(f, "{used} upside attributes exceed {allowed} slots")
            }
            BudgetError::TooManyDownsides { used, allowed } => {
                write!(f, "{used} downside attributes exceed {allowed} allowed")
            }
            BudgetError::EmptyName => write!(f, "ability needs a name"),
        }
    }
}

impl std::error::Error for BudgetError {}

/// Validates a draft against a tier budget. Submission requires a name;
/// intermediate applies validate with `require_name = false` so a draft
/// can be over-named but never over-budget.
pub fn validate_against_budget(
    def: &AbilityDefinition,
    budget: &TierBudget,
    require_name: bool,
) -> Result<(), BudgetError> {
    let spent = def.stats.total();
    if spent > budget.total_points {
        return Err(BudgetError::OverBudget {
            spent,
            budget: budget.total_points,
        });
    }
    let upsides = def.upside_count();
    if upsides > budget.upside_slots as u32 {
        return Err(BudgetError::TooManyUpsides {
            used: upsides,
            allowed: budget.upside_slots,
        });
    }
    let downsides = def.downside_count();
    if downsides > budget.downside_max as u32 {
        return Err(BudgetError::TooManyDownsides {
            used: downsides,
            allowed: budget.downside_max,
        });
    }
    if require_name && def.name.trim().is_empty() {
        return Err(BudgetError::EmptyName);
    }
    Ok(())
}

/// Derives concrete combat profiles from a validated draft. Stats map
/// linearly onto the profile the category calls for.
pub fn resolve_profiles(def: &mut AbilityDefinition) {
    match def.category {
        AbilityCategory::Projectile => {
            let s = &def.stats;
            def.projectile = Some(ProjectileProfile {
                kind: ProjectileKind::Bolt,
                speed: 12.0 + s.velocity as f32 * 0.15,
                damage: 5 + s.power as i32 / 8,
                radius: 0.15 + s.control as f32 * 0.001,
                cooldown: (1.2 - s.efficiency as f32 * 0.003).max(0.2),
                lifetime: 3.0,
                range: 30.0 + s.velocity as f32 * 0.1,
                spawn_offset: [0.2, 0.1, 0.6],
                gravity: 4.0,
                drag: 0.05,
                max_speed: 60.0,
                min_speed: 1.0,
                pierces: 0,
                despawn_on_damageable_hit: true,
                despawn_on_world_hit: true,
            });
            def.melee = None;
        }
        AbilityCategory::Melee => {
            let s = &def.stats;
            def.melee = Some(MeleeProfile {
                damage: 8 + s.power as i32 / 6,
                radius: 0.5 + s.control as f32 * 0.002,
                cooldown: (0.8 - s.efficiency as f32 * 0.002).max(0.25),
                range: 1.8 + s.velocity as f32 * 0.004,
                arc_degrees: 90.0,
            });
            def.projectile = None;
        }
        _ => {
            def.projectile = None;
            def.melee = None;
        }
    }
}
