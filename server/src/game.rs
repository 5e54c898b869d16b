//! Server-side authoritative game state.
//!
//! The tick loop exclusively owns everything in here during its step;
//! the replication channel only reads end-of-tick snapshots.

use shared::map::MapLayout;
use log::info;
use shared::math::normalize_yaw;
use shared::protocol::{InputAck, InputCommand};
use shared::world::Vec3;
use shared::{
    KinematicState, MoveInput, MovementMode, Nid, PlayerSnapshot, StepContext, FIXED_DT,
    PLAYER_MAX_HEALTH,
};
use std::collections::{BTreeSet, HashMap};

/// Non-player entities (dummies, projectiles) are addressed from the
/// upper nid range so they never collide with connection nids.
pub const ENTITY_NID_BASE: Nid = 0x8000;

/// Platform entities get stable nids derived from their pid.
pub const PLATFORM_NID_BASE: Nid = 0x7000;

/// Authoritative player entity.
#[derive(Debug, Clone)]
pub struct ServerPlayer {
    pub nid: Nid,
    pub account_id: String,
    pub kin: KinematicState,
    pub health: i32,
    pub max_health: i32,
    pub last_processed_sequence: Option<u16>,
    /// Re-sent every tick so a lost ack never stalls reconciliation.
    pub last_ack: Option<InputAck>,
    pub primary_mouse_slot: u8,
    pub secondary_mouse_slot: u8,
    pub hotbar_ability_ids: [u16; 10],
    pub unlocked_ability_ids: BTreeSet<u16>,
    /// Ability id → simulation time at which it may fire again.
    pub cooldowns: HashMap<u16, f64>,
}

impl ServerPlayer {
    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot::from_state(
            &self.kin,
            self.health,
            self.primary_mouse_slot,
            self.secondary_mouse_slot,
            self.hotbar_ability_ids,
        )
    }

    /// Ability bound to the primary mouse slot, if any.
    pub fn primary_ability_id(&self) -> Option<u16> {
        let slot = self.primary_mouse_slot as usize;
        let id = *self.hotbar_ability_ids.get(slot)?;
        (id != 0 && self.unlocked_ability_ids.contains(&id)).then_some(id)
    }
}

/// Static combat target that revives to full health on death.
#[derive(Debug, Clone)]
pub struct TrainingDummy {
    pub nid: Nid,
    pub position: Vec3,
    pub yaw: f32,
    pub health: i32,
    pub max_health: i32,
}

#[derive(Debug, Clone)]
pub struct Projectile {
    pub nid: Nid,
    pub owner_nid: Nid,
    pub position: Vec3,
    pub velocity: Vec3,
    pub radius: f32,
    pub damage: i32,
    pub ttl: f32,
    pub remaining_range: f32,
    pub gravity: f32,
    pub drag: f32,
    pub max_speed: f32,
    pub min_speed: f32,
    pub remaining_pierces: u8,
    pub despawn_on_damageable_hit: bool,
    pub despawn_on_world_hit: bool,
}

pub struct GameState {
    pub tick: u64,
    pub layout: MapLayout,
    pub players: HashMap<Nid, ServerPlayer>,
    pub dummies: Vec<TrainingDummy>,
    pub projectiles: Vec<Projectile>,
    next_entity_nid: Nid,
    next_spawn_index: usize,
    next_ability_id: u16,
}

impl GameState {
    pub fn new(layout: MapLayout) -> Self {
        let dummies = layout
            .dummy_spawns
            .iter()
            .enumerate()
            .map(|(i, (pos, yaw))| TrainingDummy {
                nid: ENTITY_NID_BASE + i as Nid,
                position: *pos,
                yaw: *yaw,
                health: PLAYER_MAX_HEALTH,
                max_health: PLAYER_MAX_HEALTH,
            })
            .collect::<Vec<_>>();
        let next_entity_nid = ENTITY_NID_BASE + dummies.len() as Nid;

        Self {
            tick: 0,
            layout,
            players: HashMap::new(),
            dummies,
            projectiles: Vec::new(),
            next_entity_nid,
            next_spawn_index: 0,
            next_ability_id: 1000,
        }
    }

    /// Simulation time at the start of the current tick.
    pub fn time(&self) -> f64 {
        self.tick as f64 * FIXED_DT as f64
    }

    pub fn alloc_entity_nid(&mut self) -> Nid {
        let nid = self.next_entity_nid;
        self.next_entity_nid = if self.next_entity_nid == Nid::MAX {
            ENTITY_NID_BASE
        } else {
            self.next_entity_nid + 1
        };
        nid
    }

    pub fn alloc_ability_id(&mut self) -> u16 {
        let id = self.next_ability_id;
        self.next_ability_id = self.next_ability_id.wrapping_add(1).max(1000);
        id
    }

    fn next_spawn(&mut self) -> Vec3 {
        let pos = self.layout.spawn_points[self.next_spawn_index % self.layout.spawn_points.len()];
        self.next_spawn_index += 1;
        pos
    }

    /// Adds a player at the next free spawn-ring position, or restores a
    /// transferred snapshot.
    pub fn add_player(
        &mut self,
        nid: Nid,
        account_id: String,
        snapshot: Option<PlayerSnapshot>,
        default_unlocked: &[u16],
    ) -> &ServerPlayer {
        let snap = snapshot.unwrap_or_else(PlayerSnapshot::fresh);
        let mut kin = snap.to_state();
        if snap.x == 0.0 && snap.y == 0.0 && snap.z == 0.0 {
            let spawn = self.next_spawn();
            kin.position = [spawn.x, spawn.y, spawn.z];
            kin.grounded = true;
        }

        let mut hotbar = snap.hotbar_ability_ids;
        if hotbar.iter().all(|&id| id == 0) {
            for (slot, id) in default_unlocked.iter().take(10).enumerate() {
                hotbar[slot] = *id;
            }
        }

        let player = ServerPlayer {
            nid,
            account_id,
            kin,
            health: snap.health.clamp(1, PLAYER_MAX_HEALTH),
            max_health: PLAYER_MAX_HEALTH,
            last_processed_sequence: None,
            last_ack: None,
            primary_mouse_slot: snap.primary_mouse_slot.min(9),
            secondary_mouse_slot: snap.secondary_mouse_slot.min(9),
            hotbar_ability_ids: hotbar,
            unlocked_ability_ids: default_unlocked.iter().copied().collect(),
            cooldowns: HashMap::new(),
        };
        info!(
            "Added player {} ({}) at ({:.2}, {:.2}, {:.2})",
            nid, player.account_id, player.kin.position[0], player.kin.position[1], player.kin.position[2]
        );
        self.players.entry(nid).or_insert(player)
    }

    /// Removes a player and sweeps the projectiles it owned.
    pub fn remove_player(&mut self, nid: Nid) {
        if self.players.remove(&nid).is_some() {
            self.projectiles.retain(|p| p.owner_nid != nid);
            info!("Removed player {}", nid);
        }
    }

    /// Steps one player with an input command and records the ack.
    pub fn apply_command(&mut self, nid: Nid, command: &InputCommand) {
        let time = self.time();
        let layout_world = &self.layout.world;
        let platforms = &self.layout.platforms;

        if let Some(player) = self.players.get_mut(&nid) {
            // Orientation is client-authoritative: the command carries the
            // pre-step view angles, carry adds on top during the step.
            player.kin.yaw = normalize_yaw(command.yaw);
            player.kin.pitch = shared::math::sanitize(command.pitch, 0.0).clamp(
                -std::f32::consts::FRAC_PI_2,
                std::f32::consts::FRAC_PI_2,
            );

            let input = MoveInput {
                forward: command.forward,
                strafe: command.strafe,
                jump: command.jump,
                sprint: command.sprint,
            };
            let ctx = StepContext {
                world: layout_world,
                platforms,
                time,
                dt: FIXED_DT,
            };
            player.kin = shared::kernel::step::step_player(&player.kin, &input, &ctx);
            player.last_processed_sequence = Some(command.sequence);

            let ack = InputAck {
                sequence: command.sequence,
                server_tick: self.tick + 1,
                x: player.kin.position[0],
                y: player.kin.position[1],
                z: player.kin.position[2],
                vx: player.kin.velocity[0],
                vy: player.kin.velocity[1],
                vz: player.kin.velocity[2],
                grounded: player.kin.grounded,
                grounded_platform_pid: player.kin.grounded_platform_pid,
                movement_mode: player.kin.mode,
            };
            player.last_ack = Some(ack);
        }
    }

    /// Steps a player that sent no command this tick, so gravity and
    /// platform carry keep acting on it. Does not advance the ack.
    pub fn step_idle(&mut self, nid: Nid) {
        let time = self.time();
        let layout_world = &self.layout.world;
        let platforms = &self.layout.platforms;
        if let Some(player) = self.players.get_mut(&nid) {
            let ctx = StepContext {
                world: layout_world,
                platforms,
                time,
                dt: FIXED_DT,
            };
            player.kin = shared::kernel::step::step_player(&player.kin, &MoveInput::default(), &ctx);
        }
    }

    /// Integer damage with clamping at zero; handles player respawn and
    /// dummy revival.
    pub fn apply_damage_to_player(&mut self, nid: Nid, damage: i32) {
        let died = match self.players.get_mut(&nid) {
            Some(player) => {
                player.health = (player.health - damage.max(0)).max(0);
                player.health == 0
            }
            None => false,
        };
        if died {
            let spawn = self.next_spawn();
            if let Some(player) = self.players.get_mut(&nid) {
                player.kin = KinematicState::at_rest(spawn);
                player.kin.mode = MovementMode::Grounded;
                player.health = player.max_health;
                info!("Player {} died and respawned", nid);
            }
        }
    }

    pub fn apply_damage_to_dummy(&mut self, nid: Nid, damage: i32) {
        if let Some(dummy) = self.dummies.iter_mut().find(|d| d.nid == nid) {
            dummy.health = (dummy.health - damage.max(0)).max(0);
            if dummy.health == 0 {
                dummy.health = dummy.max_health;
            }
        }
    }

    /// Player nids sorted for deterministic per-tick iteration.
    pub fn player_nids(&self) -> Vec<Nid> {
        let mut nids: Vec<Nid> = self.players.keys().copied().collect();
        nids.sort_unstable();
        nids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abilities::default_ability_ids;

    fn test_game() -> GameState {
        GameState::new(MapLayout::generate(1))
    }

    fn test_command(sequence: u16) -> InputCommand {
        InputCommand {
            sequence,
            forward: 1.0,
            strafe: 0.0,
            jump: false,
            sprint: false,
            primary_pressed: false,
            primary_held: false,
            yaw: 0.0,
            yaw_delta: 0.0,
            pitch: 0.0,
        }
    }

    #[test]
    fn test_add_player_spawn_separation() {
        let mut game = test_game();
        game.add_player(1, "acc-a".into(), None, &default_ability_ids());
        game.add_player(2, "acc-b".into(), None, &default_ability_ids());

        let a = game.players[&1].kin.position;
        let b = game.players[&2].kin.position;
        let dx = a[0] - b[0];
        let dz = a[2] - b[2];
        assert!((dx * dx + dz * dz).sqrt() >= shared::SPAWN_SEPARATION);
    }

    #[test]
    fn test_add_player_restores_snapshot() {
        let mut game = test_game();
        let mut snap = PlayerSnapshot::fresh();
        snap.x = 4.0;
        snap.z = -2.0;
        snap.y = 1.5;
        snap.health = 55;
        snap.hotbar_ability_ids[3] = 1;
        game.add_player(5, "acc".into(), Some(snap), &default_ability_ids());
        let p = &game.players[&5];
        assert_eq!(p.kin.position[0], 4.0);
        assert_eq!(p.health, 55);
        assert_eq!(p.hotbar_ability_ids[3], 1);
    }

    #[test]
    fn test_apply_command_advances_and_acks() {
        let mut game = test_game();
        game.add_player(1, "acc".into(), None, &default_ability_ids());
        let z_before = game.players[&1].kin.position[2];

        for seq in 1..=60u16 {
            game.apply_command(1, &test_command(seq));
            game.tick += 1;
        }

        let p = &game.players[&1];
        assert!(p.kin.position[2] > z_before + 1.0);
        assert_eq!(p.last_processed_sequence, Some(60));
        let ack = p.last_ack.unwrap();
        assert_eq!(ack.sequence, 60);
        assert_eq!(ack.z, p.kin.position[2]);
    }

    #[test]
    fn test_remove_player_sweeps_projectiles() {
        let mut game = test_game();
        game.add_player(1, "acc".into(), None, &default_ability_ids());
        let nid = game.alloc_entity_nid();
        game.projectiles.push(Projectile {
            nid,
            owner_nid: 1,
            position: Vec3::zeros(),
            velocity: Vec3::new(1.0, 0.0, 0.0),
            radius: 0.2,
            damage: 10,
            ttl: 5.0,
            remaining_range: 30.0,
            gravity: 0.0,
            drag: 0.0,
            max_speed: 60.0,
            min_speed: 0.0,
            remaining_pierces: 0,
            despawn_on_damageable_hit: true,
            despawn_on_world_hit: true,
        });

        game.remove_player(1);
        assert!(game.projectiles.is_empty());
    }

    #[test]
    fn test_player_death_respawns_full_health() {
        let mut game = test_game();
        game.add_player(1, "acc".into(), None, &default_ability_ids());
        game.players.get_mut(&1).unwrap().kin.position = [9.0, 5.0, 9.0];

        game.apply_damage_to_player(1, 500);
        let p = &game.players[&1];
        assert_eq!(p.health, p.max_health);
        assert!(p.kin.grounded);
        assert_eq!(p.kin.grounded_platform_pid, None);
        // Teleported back to a spawn-ring position.
        let r = (p.kin.position[0].powi(2) + p.kin.position[2].powi(2)).sqrt();
        assert!((r - 3.0).abs() < 0.1);
    }

    #[test]
    fn test_dummy_revives_on_death() {
        let mut game = test_game();
        let nid = game.dummies[0].nid;
        game.apply_damage_to_dummy(nid, 40);
        assert_eq!(game.dummies[0].health, PLAYER_MAX_HEALTH - 40);
        game.apply_damage_to_dummy(nid, 1000);
        assert_eq!(game.dummies[0].health, PLAYER_MAX_HEALTH);
    }

    #[test]
    fn test_health_never_negative() {
        let mut game = test_game();
        game.add_player(1, "acc".into(), None, &default_ability_ids());
        // Negative damage must not heal either.
        game.players.get_mut(&1).unwrap().health = 10;
        game.apply_damage_to_player(1, -50);
        assert_eq!(game.players[&1].health, 10);
    }
}
