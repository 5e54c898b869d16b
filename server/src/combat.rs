//! Authoritative combat: projectile integration and melee evaluation.
//!
//! All hit detection is shape-cast based. The scene is rebuilt from the
//! end-of-movement state each tick, so combat always sees the same world
//! the players were just stepped through.

use crate::game::{GameState, Projectile};
use log::debug;
use shared::abilities::{MeleeProfile, ProjectileProfile};
use shared::math::{view_direction, yaw_right};
use shared::world::{earliest_sphere_hit, iso_at, Collider, Vec3};
use shared::{Nid, CAPSULE_HALF_HEIGHT, CAPSULE_RADIUS};

/// Forward nudge applied when a projectile survives a contact.
const HIT_NUDGE: f32 = 0.002;

/// What a combat collider belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetRef {
    World,
    Platform,
    Player(Nid),
    Dummy(Nid),
}

/// Snapshot of every collider combat can hit this tick, with a parallel
/// target table mapping collider indices back to entities.
pub struct CombatScene {
    pub colliders: Vec<Collider>,
    pub targets: Vec<TargetRef>,
}

impl CombatScene {
    pub fn build(game: &GameState) -> Self {
        let mut colliders = Vec::new();
        let mut targets = Vec::new();

        for c in &game.layout.world {
            colliders.push(*c);
            targets.push(TargetRef::World);
        }
        for c in game.layout.platforms.colliders_at(game.time()) {
            colliders.push(c);
            targets.push(TargetRef::Platform);
        }
        for nid in game.player_nids() {
            let p = &game.players[&nid];
            colliders.push(Collider::Capsule {
                radius: CAPSULE_RADIUS,
                half_height: CAPSULE_HALF_HEIGHT,
                iso: iso_at(p.kin.position_vec()),
            });
            targets.push(TargetRef::Player(nid));
        }
        for d in &game.dummies {
            colliders.push(Collider::Capsule {
                radius: CAPSULE_RADIUS,
                half_height: CAPSULE_HALF_HEIGHT,
                iso: iso_at(d.position),
            });
            targets.push(TargetRef::Dummy(d.nid));
        }

        Self { colliders, targets }
    }

    fn index_of(&self, target: TargetRef) -> Option<usize> {
        self.targets.iter().position(|t| *t == target)
    }
}

/// Spawns a projectile from a player's view frame. Cancels silently if
/// the owner is gone by fire time.
pub fn spawn_projectile(game: &mut GameState, owner_nid: Nid, profile: &ProjectileProfile) -> Option<Nid> {
    let (origin, dir) = {
        let owner = game.players.get(&owner_nid)?;
        let dir = view_direction(owner.kin.yaw, owner.kin.pitch);
        let right = yaw_right(owner.kin.yaw);
        let up = Vec3::new(0.0, 1.0, 0.0);
        let origin = owner.kin.position_vec()
            + right * profile.spawn_offset[0]
            + up * profile.spawn_offset[1]
            + dir * profile.spawn_offset[2];
        (origin, dir)
    };

    let nid = game.alloc_entity_nid();
    game.projectiles.push(Projectile {
        nid,
        owner_nid,
        position: origin,
        velocity: dir * profile.speed,
        radius: profile.radius,
        damage: profile.damage,
        ttl: profile.lifetime,
        remaining_range: profile.range,
        gravity: profile.gravity,
        drag: profile.drag,
        max_speed: profile.max_speed,
        min_speed: profile.min_speed,
        remaining_pierces: profile.pierces,
        despawn_on_damageable_hit: profile.despawn_on_damageable_hit,
        despawn_on_world_hit: profile.despawn_on_world_hit,
    });
    Some(nid)
}

/// Integrates every projectile by one tick and applies resulting damage.
pub fn integrate_projectiles(game: &mut GameState, dt: f32) {
    let scene = CombatScene::build(game);
    let mut damage_events: Vec<(TargetRef, i32)> = Vec::new();

    let mut projectiles = std::mem::take(&mut game.projectiles);
    projectiles.retain_mut(|p| {
        step_projectile(p, &scene, dt, &mut damage_events)
    });
    game.projectiles = projectiles;

    for (target, damage) in damage_events {
        match target {
            TargetRef::Player(nid) => game.apply_damage_to_player(nid, damage),
            TargetRef::Dummy(nid) => game.apply_damage_to_dummy(nid, damage),
            _ => {}
        }
    }
}

fn step_projectile(
    p: &mut Projectile,
    scene: &CombatScene,
    dt: f32,
    damage_events: &mut Vec<(TargetRef, i32)>,
) -> bool {
    p.ttl -= dt;
    if p.ttl <= 0.0 {
        return false;
    }

    p.velocity.y -= p.gravity * dt;
    p.velocity *= (1.0 - p.drag * dt).max(0.0);
    let mut speed = p.velocity.norm();
    if speed > p.max_speed {
        p.velocity *= p.max_speed / speed;
        speed = p.max_speed;
    }
    if speed <= p.min_speed.max(f32::EPSILON) {
        return false;
    }

    let travel_time = dt.min(p.remaining_range / speed);
    if travel_time <= 0.0 {
        return false;
    }

    let owner_idx = scene.index_of(TargetRef::Player(p.owner_nid));
    let translation = p.velocity * travel_time;
    let dir = translation / translation.norm();

    match earliest_sphere_hit(&scene.colliders, p.radius, p.position, translation, 1.0, owner_idx) {
        None => {
            p.position += translation;
            p.remaining_range -= speed * travel_time;
            p.remaining_range > 0.0
        }
        Some(hit) => {
            let travelled = speed * travel_time * hit.fraction;
            p.position += dir * travelled;
            p.remaining_range -= travelled;

            match scene.targets[hit.collider] {
                TargetRef::World | TargetRef::Platform => {
                    if p.despawn_on_world_hit {
                        false
                    } else {
                        p.position += dir * HIT_NUDGE;
                        true
                    }
                }
                target @ (TargetRef::Player(_) | TargetRef::Dummy(_)) => {
                    if p.remaining_pierces > 0 {
                        damage_events.push((target, p.damage));
                        p.remaining_pierces -= 1;
                        p.position += dir * HIT_NUDGE;
                        // Step past the pierced body so the next tick's
                        // cast starts clear of it.
                        p.position += dir * (CAPSULE_RADIUS + p.radius) * 2.5;
                        true
                    } else if !p.despawn_on_damageable_hit {
                        // Damage capacity spent; passes through inert.
                        p.position += dir * HIT_NUDGE;
                        p.position += dir * (CAPSULE_RADIUS + p.radius) * 2.5;
                        true
                    } else {
                        damage_events.push((target, p.damage));
                        false
                    }
                }
            }
        }
    }
}

/// Closest distance between two segments (used for the melee sweep
/// against a target's capsule axis).
pub fn segment_segment_distance(p1: Vec3, q1: Vec3, p2: Vec3, q2: Vec3) -> f32 {
    let d1 = q1 - p1;
    let d2 = q2 - p2;
    let r = p1 - p2;
    let a = d1.dot(&d1);
    let e = d2.dot(&d2);
    let f = d2.dot(&r);

    let (s, t);
    if a <= f32::EPSILON && e <= f32::EPSILON {
        return (p1 - p2).norm();
    }
    if a <= f32::EPSILON {
        s = 0.0;
        t = (f / e).clamp(0.0, 1.0);
    } else {
        let c = d1.dot(&r);
        if e <= f32::EPSILON {
            t = 0.0;
            s = (-c / a).clamp(0.0, 1.0);
        } else {
            let b = d1.dot(&d2);
            let denom = a * e - b * b;
            let mut s_val = if denom > f32::EPSILON {
                ((b * f - c * e) / denom).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let mut t_val = (b * s_val + f) / e;
            if t_val < 0.0 {
                t_val = 0.0;
                s_val = (-c / a).clamp(0.0, 1.0);
            } else if t_val > 1.0 {
                t_val = 1.0;
                s_val = ((b - c) / a).clamp(0.0, 1.0);
            }
            s = s_val;
            t = t_val;
        }
    }

    let closest1 = p1 + d1 * s;
    let closest2 = p2 + d2 * t;
    (closest1 - closest2).norm()
}

/// Evaluates a melee swing for the tick the action was pressed.
///
/// Selection: arc test against the view direction, then a swept-segment
/// distance test against each candidate capsule, then the nearest
/// survivor by forward projection that also passes a line-of-sight cast.
pub fn perform_melee(game: &GameState, attacker_nid: Nid, profile: &MeleeProfile) -> Option<TargetRef> {
    let attacker = game.players.get(&attacker_nid)?;
    let origin = attacker.kin.position_vec();
    let dir = view_direction(attacker.kin.yaw, attacker.kin.pitch);
    let reach = origin + dir * profile.range;
    let cos_half_arc = (profile.arc_degrees.to_radians() / 2.0).cos();
    let scene = CombatScene::build(game);

    let mut candidates: Vec<(TargetRef, Vec3)> = Vec::new();
    for nid in game.player_nids() {
        if nid != attacker_nid {
            candidates.push((TargetRef::Player(nid), game.players[&nid].kin.position_vec()));
        }
    }
    for d in &game.dummies {
        candidates.push((TargetRef::Dummy(d.nid), d.position));
    }

    let loose_reach = profile.range + profile.radius + CAPSULE_RADIUS + CAPSULE_HALF_HEIGHT;
    let mut best: Option<(TargetRef, f32)> = None;

    for (target, center) in candidates {
        let delta = center - origin;
        if delta.x.abs() > loose_reach || delta.y.abs() > loose_reach || delta.z.abs() > loose_reach {
            continue;
        }

        let dist = delta.norm();
        if dist > f32::EPSILON && delta.dot(&dir) / dist < cos_half_arc {
            continue;
        }

        let axis_half = Vec3::new(0.0, CAPSULE_HALF_HEIGHT, 0.0);
        let seg_dist = segment_segment_distance(origin, reach, center - axis_half, center + axis_half);
        if seg_dist > profile.radius + CAPSULE_RADIUS {
            continue;
        }

        let forward = delta.dot(&dir);
        if best.map_or(true, |(_, f)| forward < f) && line_of_sight(&scene, attacker_nid, target, origin, center)
        {
            best = Some((target, forward));
        }
    }

    if best.is_none() {
        debug!("Melee swing by {} hit nothing", attacker_nid);
    }
    best.map(|(target, _)| target)
}

/// True if nothing blocks the segment from attacker to target center.
fn line_of_sight(scene: &CombatScene, attacker: Nid, target: TargetRef, from: Vec3, to: Vec3) -> bool {
    let delta = to - from;
    if delta.norm() <= f32::EPSILON {
        return true;
    }
    let attacker_idx = scene.index_of(TargetRef::Player(attacker));
    match earliest_sphere_hit(&scene.colliders, 0.01, from, delta, 1.0, attacker_idx) {
        None => true,
        Some(hit) => scene.targets[hit.collider] == target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abilities::default_ability_ids;
    use shared::map::MapLayout;
    use assert_approx_eq::assert_approx_eq;

    fn test_game() -> GameState {
        GameState::new(MapLayout::generate(1))
    }

    fn bolt() -> ProjectileProfile {
        ProjectileProfile {
            kind: shared::abilities::ProjectileKind::Bolt,
            speed: 20.0,
            damage: 15,
            radius: 0.15,
            cooldown: 0.5,
            lifetime: 3.0,
            range: 40.0,
            spawn_offset: [0.0, 0.0, 0.6],
            gravity: 0.0,
            drag: 0.0,
            max_speed: 60.0,
            min_speed: 0.0,
            pierces: 0,
            despawn_on_damageable_hit: true,
            despawn_on_world_hit: true,
        }
    }

    fn strike() -> MeleeProfile {
        MeleeProfile {
            damage: 20,
            radius: 0.5,
            cooldown: 0.5,
            range: 2.0,
            arc_degrees: 90.0,
        }
    }

    /// Player at the origin aiming straight down +Z at a dummy.
    fn game_with_shooter_and_dummy(dummy_z: f32) -> GameState {
        let mut game = test_game();
        game.add_player(1, "shooter".into(), None, &default_ability_ids());
        let p = game.players.get_mut(&1).unwrap();
        p.kin.position = [0.0, 1.0, 0.0];
        p.kin.yaw = 0.0;
        p.kin.pitch = 0.0;
        game.dummies.truncate(1);
        game.dummies[0].position = Vec3::new(0.0, 1.0, dummy_z);
        game
    }

    #[test]
    fn test_projectile_hits_dummy_exact_damage() {
        let mut game = game_with_shooter_and_dummy(4.0);
        let start_health = game.dummies[0].health;
        spawn_projectile(&mut game, 1, &bolt()).unwrap();

        let mut hit_tick = None;
        for tick in 0..60 {
            integrate_projectiles(&mut game, shared::FIXED_DT);
            if game.dummies[0].health != start_health {
                hit_tick = Some(tick);
                break;
            }
        }
        assert!(hit_tick.is_some(), "projectile never connected");
        assert_eq!(game.dummies[0].health, start_health - 15);
        // despawn_on_damageable_hit removes it on impact
        assert!(game.projectiles.is_empty());
    }

    #[test]
    fn test_projectile_cannot_damage_owner() {
        let mut game = test_game();
        game.add_player(1, "owner".into(), None, &default_ability_ids());
        game.players.get_mut(&1).unwrap().kin.position = [0.0, 1.0, 0.0];
        game.dummies.clear();

        // Fired backwards through the owner's own capsule.
        let nid = game.alloc_entity_nid();
        game.projectiles.push(Projectile {
            nid,
            owner_nid: 1,
            position: Vec3::new(0.0, 1.0, -1.0),
            velocity: Vec3::new(0.0, 0.0, 5.0),
            radius: 0.1,
            damage: 50,
            ttl: 2.0,
            remaining_range: 20.0,
            gravity: 0.0,
            drag: 0.0,
            max_speed: 10.0,
            min_speed: 0.0,
            remaining_pierces: 0,
            despawn_on_damageable_hit: true,
            despawn_on_world_hit: true,
        });

        let health_before = game.players[&1].health;
        for _ in 0..60 {
            integrate_projectiles(&mut game, shared::FIXED_DT);
        }
        assert_eq!(game.players[&1].health, health_before);
    }

    #[test]
    fn test_projectile_ttl_expiry() {
        let mut game = test_game();
        game.dummies.clear();
        let nid = game.alloc_entity_nid();
        game.projectiles.push(Projectile {
            nid,
            owner_nid: 99,
            position: Vec3::new(0.0, 50.0, 0.0),
            velocity: Vec3::new(0.0, 0.0, 1.0),
            radius: 0.1,
            damage: 1,
            ttl: 0.05,
            remaining_range: 100.0,
            gravity: 0.0,
            drag: 0.0,
            max_speed: 10.0,
            min_speed: 0.0,
            remaining_pierces: 0,
            despawn_on_damageable_hit: true,
            despawn_on_world_hit: true,
        });
        for _ in 0..10 {
            integrate_projectiles(&mut game, shared::FIXED_DT);
        }
        assert!(game.projectiles.is_empty());
    }

    #[test]
    fn test_projectile_range_exhaustion() {
        let mut game = test_game();
        game.dummies.clear();
        let nid = game.alloc_entity_nid();
        game.projectiles.push(Projectile {
            nid,
            owner_nid: 99,
            position: Vec3::new(0.0, 50.0, 0.0),
            velocity: Vec3::new(0.0, 0.0, 20.0),
            radius: 0.1,
            damage: 1,
            ttl: 100.0,
            remaining_range: 2.0,
            gravity: 0.0,
            drag: 0.0,
            max_speed: 60.0,
            min_speed: 0.0,
            remaining_pierces: 0,
            despawn_on_damageable_hit: true,
            despawn_on_world_hit: true,
        });
        for _ in 0..30 {
            integrate_projectiles(&mut game, shared::FIXED_DT);
        }
        assert!(game.projectiles.is_empty());
    }

    #[test]
    fn test_pierce_damages_and_survives() {
        let mut game = game_with_shooter_and_dummy(3.0);
        // Second dummy directly behind the first.
        game.dummies.push(crate::game::TrainingDummy {
            nid: 0x9000,
            position: Vec3::new(0.0, 1.0, 6.0),
            yaw: 0.0,
            health: 100,
            max_health: 100,
        });

        let mut profile = bolt();
        profile.pierces = 1;
        spawn_projectile(&mut game, 1, &profile).unwrap();

        for _ in 0..60 {
            integrate_projectiles(&mut game, shared::FIXED_DT);
        }
        assert_eq!(game.dummies[0].health, 85);
        assert_eq!(game.dummies[1].health, 85);
    }

    #[test]
    fn test_gravity_and_drag_shape_velocity() {
        let mut game = test_game();
        game.dummies.clear();
        let nid = game.alloc_entity_nid();
        game.projectiles.push(Projectile {
            nid,
            owner_nid: 99,
            position: Vec3::new(0.0, 50.0, 0.0),
            velocity: Vec3::new(0.0, 0.0, 10.0),
            radius: 0.1,
            damage: 1,
            ttl: 10.0,
            remaining_range: 1000.0,
            gravity: 9.8,
            drag: 0.5,
            max_speed: 60.0,
            min_speed: 0.0,
            remaining_pierces: 0,
            despawn_on_damageable_hit: true,
            despawn_on_world_hit: true,
        });
        integrate_projectiles(&mut game, shared::FIXED_DT);
        let p = &game.projectiles[0];
        assert!(p.velocity.y < 0.0);
        assert!(p.velocity.z < 10.0);
    }

    #[test]
    fn test_melee_hits_target_in_arc() {
        let game = game_with_shooter_and_dummy(1.5);
        let target = perform_melee(&game, 1, &strike());
        assert_eq!(target, Some(TargetRef::Dummy(game.dummies[0].nid)));
    }

    #[test]
    fn test_melee_misses_behind() {
        let game = game_with_shooter_and_dummy(-1.5);
        assert_eq!(perform_melee(&game, 1, &strike()), None);
    }

    #[test]
    fn test_melee_out_of_range() {
        let game = game_with_shooter_and_dummy(5.0);
        assert_eq!(perform_melee(&game, 1, &strike()), None);
    }

    #[test]
    fn test_melee_picks_nearest() {
        let mut game = game_with_shooter_and_dummy(1.5);
        game.dummies.push(crate::game::TrainingDummy {
            nid: 0x9001,
            position: Vec3::new(0.0, 1.0, 1.0),
            yaw: 0.0,
            health: 100,
            max_health: 100,
        });
        let target = perform_melee(&game, 1, &strike());
        assert_eq!(target, Some(TargetRef::Dummy(0x9001)));
    }

    #[test]
    fn test_melee_blocked_by_wall() {
        let mut game = game_with_shooter_and_dummy(1.8);
        // Wall between attacker and dummy.
        game.layout.world.push(Collider::Cuboid {
            half_extents: Vec3::new(1.0, 2.0, 0.1),
            iso: iso_at(Vec3::new(0.0, 1.0, 0.9)),
        });
        assert_eq!(perform_melee(&game, 1, &strike()), None);
    }

    #[test]
    fn test_segment_distance_parallel() {
        let d = segment_segment_distance(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
        );
        assert_approx_eq!(d, 1.0, 1e-5);
    }

    #[test]
    fn test_segment_distance_crossing() {
        let d = segment_segment_distance(
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, -1.0, 0.5),
            Vec3::new(0.0, 1.0, 0.5),
        );
        assert_approx_eq!(d, 0.5, 1e-5);
    }
}
