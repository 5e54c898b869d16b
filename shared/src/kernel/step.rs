//! Full per-player kinematic step: carry, velocity shaping, sweep,
//! grounding resolution.
//!
//! This function is the server's authoritative step *and* the client's
//! prediction/replay step. Both sides must call it with the same inputs
//! to get bit-identical results, so every branch below is a function of
//! its arguments only.

use crate::kernel::movement::{step_horizontal_movement, MoveInput};
use crate::kernel::platforms::{apply_platform_carry, PlatformIndex};
use crate::math::{normalize_yaw, sanitize, sanitize_vec};
use crate::world::{probe_ground, sweep_capsule, Collider, Vec3};
use crate::{
    MovementMode, Pid, CAPSULE_HALF_HEIGHT, CAPSULE_RADIUS, FLY_SPEED, GRAVITY,
    GROUND_SNAP_DISTANCE, JUMP_VELOCITY, MAX_CLIMB_SLOPE_DEG, MAX_TICK_DT, MIN_SLIDE_SLOPE_DEG,
    MIN_TICK_DT,
};
use serde::{Deserialize, Serialize};

/// Kinematic state of one player body. `position` is the capsule center.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KinematicState {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub yaw: f32,
    pub pitch: f32,
    pub grounded: bool,
    pub grounded_platform_pid: Option<Pid>,
    pub mode: MovementMode,
}

impl KinematicState {
    pub fn at_rest(position: Vec3) -> Self {
        Self {
            position: [position.x, position.y, position.z],
            velocity: [0.0; 3],
            yaw: 0.0,
            pitch: 0.0,
            grounded: true,
            grounded_platform_pid: None,
            mode: MovementMode::Grounded,
        }
    }

    pub fn position_vec(&self) -> Vec3 {
        Vec3::new(self.position[0], self.position[1], self.position[2])
    }

    pub fn velocity_vec(&self) -> Vec3 {
        Vec3::new(self.velocity[0], self.velocity[1], self.velocity[2])
    }

    /// Bottom point of the capsule, used for platform grounding.
    pub fn foot(&self) -> Vec3 {
        self.position_vec() - Vec3::new(0.0, CAPSULE_HALF_HEIGHT + CAPSULE_RADIUS, 0.0)
    }

    fn set_position(&mut self, p: Vec3) {
        self.position = [p.x, p.y, p.z];
    }

    fn set_velocity(&mut self, v: Vec3) {
        self.velocity = [v.x, v.y, v.z];
    }
}

/// Immutable world inputs for one step.
pub struct StepContext<'a> {
    /// Static world colliders (excludes platforms).
    pub world: &'a [Collider],
    pub platforms: &'a PlatformIndex,
    /// Simulation time at the start of the step, seconds.
    pub time: f64,
    /// Step duration; clamped to `[MIN_TICK_DT, MAX_TICK_DT]`.
    pub dt: f32,
}

fn walkable_normal_y() -> f32 {
    (MAX_CLIMB_SLOPE_DEG.to_radians()).cos()
}

fn slide_normal_y() -> f32 {
    (MIN_SLIDE_SLOPE_DEG.to_radians()).cos()
}

/// Combines solver output with grounding resolution, enforcing the two
/// grounding invariants: a platform pid implies `grounded`, and a
/// platform-grounded body has no vertical velocity.
pub fn resolve_post_step_state(
    state: &mut KinematicState,
    platforms: &PlatformIndex,
    time_end: f64,
    ground_hit_walkable: bool,
    preferred_pid: Option<Pid>,
) {
    let pid = if state.mode == MovementMode::Grounded {
        platforms.find_grounded_platform(time_end, state.foot(), preferred_pid)
    } else {
        None
    };

    state.grounded = ground_hit_walkable || pid.is_some();
    state.grounded_platform_pid = pid;

    if state.grounded {
        let mut v = state.velocity_vec();
        v.y = 0.0;
        state.set_velocity(v);
    }
}

/// Advances one player body by one fixed step.
pub fn step_player(prev: &KinematicState, input: &MoveInput, ctx: &StepContext) -> KinematicState {
    let dt = sanitize(ctx.dt, crate::FIXED_DT).clamp(MIN_TICK_DT, MAX_TICK_DT);
    let input = input.sanitized();
    let time_end = ctx.time + dt as f64;

    let mut state = *prev;
    state.set_position(sanitize_vec(state.position_vec()));
    state.set_velocity(sanitize_vec(state.velocity_vec()));
    state.yaw = normalize_yaw(state.yaw);
    state.pitch = sanitize(state.pitch, 0.0);

    // 1. Platform carry. The supporting platform drags the body through
    //    its rigid delta before the body's own motion integrates. A
    //    platform that vanished mid-step contributes nothing.
    let mut carry_pid = None;
    if state.grounded {
        if let Some(pid) = state.grounded_platform_pid {
            match ctx.platforms.get(pid) {
                Some(def) => {
                    let prev_pose = def.sample(ctx.time);
                    let cur_pose = def.sample(time_end);
                    let (carried, yaw_delta) =
                        apply_platform_carry(&prev_pose, &cur_pose, state.position_vec());
                    state.set_position(carried);
                    state.yaw = normalize_yaw(state.yaw + yaw_delta);
                    carry_pid = Some(pid);
                }
                None => {
                    state.grounded_platform_pid = None;
                }
            }
        }
    }

    // 2. Velocity shaping.
    let mut v = step_horizontal_movement(state.velocity_vec(), &input, state.yaw, state.grounded, dt);
    let mut jumped = false;

    match state.mode {
        MovementMode::Grounded => {
            if input.jump && state.grounded {
                v.y = JUMP_VELOCITY;
                state.grounded = false;
                state.grounded_platform_pid = None;
                jumped = true;
            }
            if !state.grounded {
                v.y -= GRAVITY * dt;
            }
        }
        MovementMode::Flying => {
            v.y = if input.jump { FLY_SPEED } else { 0.0 };
        }
    }
    state.set_velocity(v);

    // 3. Kinematic sweep against the static world plus end-of-step
    //    platform poses.
    let mut colliders: Vec<Collider> = Vec::with_capacity(ctx.world.len() + ctx.platforms.defs().len());
    colliders.extend_from_slice(ctx.world);
    colliders.extend(ctx.platforms.colliders_at(time_end));

    let outcome = sweep_capsule(
        &colliders,
        CAPSULE_HALF_HEIGHT,
        CAPSULE_RADIUS,
        state.position_vec(),
        v * dt,
    );
    state.set_position(outcome.end_pos);

    // 4. Ground snap and grounding resolution. A fresh jump skips both so
    //    the body actually leaves the surface.
    let mut ground_hit_walkable = false;
    if state.mode == MovementMode::Grounded && !jumped && state.velocity[1] <= 0.0 {
        if let Some((snapped, hit)) = probe_ground(
            &colliders,
            CAPSULE_HALF_HEIGHT,
            CAPSULE_RADIUS,
            state.position_vec(),
            GROUND_SNAP_DISTANCE,
        ) {
            if hit.normal.y >= walkable_normal_y() {
                state.set_position(snapped);
                ground_hit_walkable = true;
            } else if hit.normal.y <= slide_normal_y() {
                // Too steep to ever arrest a fall; keep falling.
            }
        }
    }

    if jumped {
        state.grounded = false;
        state.grounded_platform_pid = None;
    } else {
        let preferred = carry_pid.or(prev.grounded_platform_pid);
        resolve_post_step_state(
            &mut state,
            ctx.platforms,
            time_end,
            ground_hit_walkable,
            preferred,
        );
    }

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::platforms::{PlatformDef, PlatformMotion};
    use crate::FIXED_DT;
    use assert_approx_eq::assert_approx_eq;

    fn flat_world() -> Vec<Collider> {
        vec![Collider::Plane {
            normal: Vec3::new(0.0, 1.0, 0.0),
            dist: 0.0,
        }]
    }

    fn standing_state() -> KinematicState {
        // Capsule resting on the floor plane.
        KinematicState::at_rest(Vec3::new(0.0, CAPSULE_HALF_HEIGHT + CAPSULE_RADIUS + 0.01, 0.0))
    }

    fn ctx<'a>(world: &'a [Collider], platforms: &'a PlatformIndex, time: f64) -> StepContext<'a> {
        StepContext {
            world,
            platforms,
            time,
            dt: FIXED_DT,
        }
    }

    #[test]
    fn test_walk_forward_advances_z() {
        let world = flat_world();
        let platforms = PlatformIndex::default();
        let mut state = standing_state();
        let input = MoveInput {
            forward: 1.0,
            ..Default::default()
        };
        for i in 0..60 {
            state = step_player(&state, &input, &ctx(&world, &platforms, i as f64 * FIXED_DT as f64));
        }
        assert!(state.position[2] > 1.0);
        assert!(state.grounded);
    }

    #[test]
    fn test_jump_rises_then_lands() {
        let world = flat_world();
        let platforms = PlatformIndex::default();
        let mut state = standing_state();
        let baseline = state.position[1];

        let jump = MoveInput {
            jump: true,
            ..Default::default()
        };
        state = step_player(&state, &jump, &ctx(&world, &platforms, 0.0));
        assert!(!state.grounded);

        let mut peak = baseline;
        let idle = MoveInput::default();
        for i in 1..120 {
            state = step_player(&state, &idle, &ctx(&world, &platforms, i as f64 * FIXED_DT as f64));
            peak = peak.max(state.position[1]);
        }
        assert!(peak - baseline >= 0.55);
        assert!(state.grounded);
        assert_approx_eq!(state.velocity[1], 0.0, 1e-6);
    }

    #[test]
    fn test_no_double_jump_midair() {
        let world = flat_world();
        let platforms = PlatformIndex::default();
        let mut state = standing_state();
        let jump = MoveInput {
            jump: true,
            ..Default::default()
        };
        state = step_player(&state, &jump, &ctx(&world, &platforms, 0.0));
        let vy_after_first = state.velocity[1];
        state = step_player(&state, &jump, &ctx(&world, &platforms, FIXED_DT as f64));
        // Second jump input while airborne must not re-apply jump velocity.
        assert!(state.velocity[1] < vy_after_first);
    }

    #[test]
    fn test_grounded_platform_implies_grounded() {
        let platform = PlatformDef {
            pid: 7,
            half_extents: [2.0, 0.25, 2.0],
            motion: PlatformMotion::Linear {
                origin: [0.0, 1.0, 0.0],
                axis: [0.0, 0.0, 0.0],
                amplitude: 0.0,
                period: 1.0,
            },
        };
        let platforms = PlatformIndex::new(vec![platform]);
        let world: Vec<Collider> = Vec::new();
        let top = 1.25;
        let mut state = KinematicState::at_rest(Vec3::new(
            0.0,
            top + CAPSULE_HALF_HEIGHT + CAPSULE_RADIUS + 0.01,
            0.0,
        ));
        state = step_player(&state, &MoveInput::default(), &ctx(&world, &platforms, 0.0));
        assert_eq!(state.grounded_platform_pid, Some(7));
        assert!(state.grounded);
        assert_approx_eq!(state.velocity[1], 0.0, 1e-6);
    }

    #[test]
    fn test_linear_platform_carries_body() {
        let platform = PlatformDef {
            pid: 3,
            half_extents: [2.0, 0.25, 2.0],
            motion: PlatformMotion::Linear {
                origin: [0.0, 1.0, 0.0],
                axis: [1.0, 0.0, 0.0],
                amplitude: 2.0,
                period: 4.0,
            },
        };
        let platforms = PlatformIndex::new(vec![platform]);
        let world: Vec<Collider> = Vec::new();
        let mut state = KinematicState::at_rest(Vec3::new(
            0.0,
            1.25 + CAPSULE_HALF_HEIGHT + CAPSULE_RADIUS + 0.01,
            0.0,
        ));
        // Latch onto the platform first.
        state = step_player(&state, &MoveInput::default(), &ctx(&world, &platforms, 0.0));
        assert_eq!(state.grounded_platform_pid, Some(3));

        let x_before = state.position[0];
        for i in 1..30 {
            state = step_player(
                &state,
                &MoveInput::default(),
                &ctx(&world, &platforms, i as f64 * FIXED_DT as f64),
            );
        }
        // Platform moves along +X early in its sine period and drags the
        // idle body with it.
        assert!(state.position[0] > x_before + 0.1);
    }

    #[test]
    fn test_rotating_platform_carries_yaw() {
        let platform = PlatformDef {
            pid: 4,
            half_extents: [3.0, 0.25, 3.0],
            motion: PlatformMotion::Rotating {
                origin: [0.0, 1.0, 0.0],
                yaw_rate: 1.0,
            },
        };
        let platforms = PlatformIndex::new(vec![platform]);
        let world: Vec<Collider> = Vec::new();
        let mut state = KinematicState::at_rest(Vec3::new(
            1.0,
            1.25 + CAPSULE_HALF_HEIGHT + CAPSULE_RADIUS + 0.01,
            0.0,
        ));
        state = step_player(&state, &MoveInput::default(), &ctx(&world, &platforms, 0.0));
        assert_eq!(state.grounded_platform_pid, Some(4));

        let yaw_before = state.yaw;
        state = step_player(
            &state,
            &MoveInput::default(),
            &ctx(&world, &platforms, FIXED_DT as f64),
        );
        assert_approx_eq!(state.yaw - yaw_before, FIXED_DT, 1e-4);
    }

    #[test]
    fn test_vanished_platform_clears_pid() {
        let world = flat_world();
        let platforms = PlatformIndex::default();
        let mut state = standing_state();
        state.grounded_platform_pid = Some(99);
        state = step_player(&state, &MoveInput::default(), &ctx(&world, &platforms, 0.0));
        assert_eq!(state.grounded_platform_pid, None);
    }

    #[test]
    fn test_dt_clamped() {
        let world = flat_world();
        let platforms = PlatformIndex::default();
        let state = standing_state();
        let input = MoveInput {
            forward: 1.0,
            ..Default::default()
        };
        let huge = StepContext {
            world: &world,
            platforms: &platforms,
            time: 0.0,
            dt: 10.0,
        };
        let stepped = step_player(&state, &input, &huge);
        // One clamped step can move at most MAX_TICK_DT worth of travel.
        assert!(stepped.position[2] <= crate::GROUND_SPEED * MAX_TICK_DT + 1e-3);
    }

    #[test]
    fn test_nan_state_recovers() {
        let world = flat_world();
        let platforms = PlatformIndex::default();
        let mut state = standing_state();
        state.velocity = [f32::NAN, f32::NAN, f32::NAN];
        state.yaw = f32::NAN;
        let stepped = step_player(&state, &MoveInput::default(), &ctx(&world, &platforms, 0.0));
        assert!(stepped.position.iter().all(|c| c.is_finite()));
        assert!(stepped.velocity.iter().all(|c| c.is_finite()));
        assert!(stepped.yaw.is_finite());
    }

    #[test]
    fn test_flying_mode_ignores_gravity() {
        let world = flat_world();
        let platforms = PlatformIndex::default();
        let mut state = standing_state();
        state.mode = MovementMode::Flying;
        state.position[1] = 5.0;
        state.grounded = false;
        let stepped = step_player(&state, &MoveInput::default(), &ctx(&world, &platforms, 0.0));
        assert_approx_eq!(stepped.velocity[1], 0.0, 1e-6);
        let ascend = MoveInput {
            jump: true,
            ..Default::default()
        };
        let stepped = step_player(&state, &ascend, &ctx(&world, &platforms, 0.0));
        assert!(stepped.velocity[1] > 0.0);
    }

    #[test]
    fn test_determinism_same_inputs_same_output() {
        let world = flat_world();
        let platforms = PlatformIndex::default();
        let input = MoveInput {
            forward: 0.7,
            strafe: -0.4,
            sprint: true,
            ..Default::default()
        };
        let mut a = standing_state();
        let mut b = standing_state();
        for i in 0..50 {
            let c = ctx(&world, &platforms, i as f64 * FIXED_DT as f64);
            a = step_player(&a, &input, &c);
            b = step_player(&b, &input, &c);
        }
        assert_eq!(a.position, b.position);
        assert_eq!(a.velocity, b.velocity);
    }
}
