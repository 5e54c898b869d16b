//! Movement parity between the authoritative server step and the client
//! predictor.
//!
//! Both sides run the shared kernel over the same scripted command
//! trace, tick by tick. After every tick the client's predicted pose
//! must match the server's post-step pose within 1e-3 units and 1e-4
//! radians, and feeding the server ack back through reconciliation must
//! never hard-snap or leave residual smoothing error.

use client::game::{ClientSim, PendingInput, ReconcileOutcome};
use server::game::GameState;
use shared::map::MapLayout;
use shared::protocol::InputCommand;
use shared::world::Vec3;
use shared::{KinematicState, MoveInput, CAPSULE_HALF_HEIGHT, CAPSULE_RADIUS};

const POSITION_TOLERANCE: f32 = 1e-3;
const YAW_TOLERANCE: f32 = 1e-4;

struct ParityHarness {
    server: GameState,
    client: ClientSim,
    sequence: u16,
}

impl ParityHarness {
    fn new(seed: u64, start: Option<KinematicState>) -> Self {
        let layout = MapLayout::generate(seed);
        let mut server = GameState::new(layout.clone());
        server.add_player(1, "parity".into(), None, &[1, 2]);
        if let Some(start) = start {
            server.players.get_mut(&1).unwrap().kin = start;
        }

        let mut client = ClientSim::new(layout.world.clone(), layout.platforms.clone(), 0);
        client.state = server.players[&1].kin;

        Self {
            server,
            client,
            sequence: 0,
        }
    }

    fn command(&mut self, movement: MoveInput, yaw: f32, pitch: f32) -> InputCommand {
        self.sequence = self.sequence.wrapping_add(1);
        InputCommand {
            sequence: self.sequence,
            forward: movement.forward,
            strafe: movement.strafe,
            jump: movement.jump,
            sprint: movement.sprint,
            primary_pressed: false,
            primary_held: false,
            yaw,
            yaw_delta: 0.0,
            pitch,
        }
    }

    /// Runs one lockstep tick and asserts frame parity.
    fn step(&mut self, movement: MoveInput, yaw_delta: f32) {
        let yaw = shared::math::normalize_yaw(self.client.state.yaw + yaw_delta);
        let command = self.command(movement, yaw, 0.0);

        self.client.predict(PendingInput {
            sequence: command.sequence,
            input: movement,
            yaw: command.yaw,
            pitch: command.pitch,
        });

        self.server.apply_command(1, &command);
        self.server.tick += 1;

        let server_kin = self.server.players[&1].kin;
        let predicted = self.client.state;

        let dx = (server_kin.position[0] - predicted.position[0]).abs();
        let dy = (server_kin.position[1] - predicted.position[1]).abs();
        let dz = (server_kin.position[2] - predicted.position[2]).abs();
        assert!(
            dx < POSITION_TOLERANCE && dy < POSITION_TOLERANCE && dz < POSITION_TOLERANCE,
            "tick {}: position diverged by ({dx}, {dy}, {dz})",
            self.server.tick
        );
        let dyaw = shared::math::yaw_difference(server_kin.yaw, predicted.yaw).abs();
        assert!(
            dyaw < YAW_TOLERANCE,
            "tick {}: yaw diverged by {dyaw}",
            self.server.tick
        );
        assert_eq!(
            server_kin.grounded, predicted.grounded,
            "tick {}: grounded flag diverged",
            self.server.tick
        );
        assert_eq!(
            server_kin.grounded_platform_pid, predicted.grounded_platform_pid,
            "tick {}: platform pid diverged",
            self.server.tick
        );

        // Close the loop: the ack must reconcile with no correction.
        let ack = self.server.players[&1].last_ack.unwrap();
        let outcome = self.client.apply_ack(&ack);
        assert_ne!(outcome, ReconcileOutcome::HardSnap, "tick {}", self.server.tick);
        assert!(
            self.client.smoothing_offset_norm() < POSITION_TOLERANCE,
            "tick {}: residual smoothing {}",
            self.server.tick,
            self.client.smoothing_offset_norm()
        );

        // Grounding invariant, every tick, both sides.
        for state in [&server_kin, &predicted] {
            if state.grounded_platform_pid.is_some() {
                assert!(state.grounded, "platform pid without grounded flag");
            }
        }
    }
}

fn idle() -> MoveInput {
    MoveInput::default()
}

fn forward() -> MoveInput {
    MoveInput {
        forward: 1.0,
        ..Default::default()
    }
}

/// 240 mixed ground-movement ticks: walk, sprint, strafing turn, jump.
#[test]
fn test_parity_ground_trace() {
    let mut harness = ParityHarness::new(1, None);

    for _ in 0..60 {
        harness.step(forward(), 0.0);
    }
    for _ in 0..60 {
        harness.step(
            MoveInput {
                forward: 1.0,
                sprint: true,
                ..Default::default()
            },
            0.0,
        );
    }
    for _ in 0..60 {
        harness.step(
            MoveInput {
                forward: 0.7,
                strafe: 0.4,
                ..Default::default()
            },
            0.03,
        );
    }
    harness.step(
        MoveInput {
            jump: true,
            ..Default::default()
        },
        0.0,
    );
    for _ in 0..59 {
        harness.step(forward(), 0.0);
    }
}

/// 90 ticks standing and walking on the rotating platform, where carry
/// drives both translation and yaw.
#[test]
fn test_parity_rotating_platform_trace() {
    let layout = MapLayout::generate(1);
    let def = layout.platforms.get(2).expect("rotating platform");
    let origin = match def.motion {
        shared::PlatformMotion::Rotating { origin, .. } => origin,
        _ => panic!("pid 2 should rotate"),
    };
    let top = origin[1] + def.half_extents[1];
    let start = KinematicState::at_rest(Vec3::new(
        origin[0] + 1.0,
        top + CAPSULE_HALF_HEIGHT + CAPSULE_RADIUS + 0.01,
        origin[2],
    ));

    let mut harness = ParityHarness::new(1, Some(start));

    for _ in 0..60 {
        harness.step(idle(), 0.0);
    }
    // Carry must have latched onto the platform on both sides.
    assert_eq!(harness.client.state.grounded_platform_pid, Some(2));
    for _ in 0..30 {
        harness.step(
            MoveInput {
                forward: 0.5,
                ..Default::default()
            },
            0.0,
        );
    }
}

/// The full ≥290-tick scripted requirement in one run.
#[test]
fn test_parity_full_mixed_trace() {
    let mut harness = ParityHarness::new(3, None);

    // Walk, turn, sprint.
    for _ in 0..80 {
        harness.step(forward(), 0.01);
    }
    for _ in 0..80 {
        harness.step(
            MoveInput {
                forward: 1.0,
                sprint: true,
                ..Default::default()
            },
            -0.02,
        );
    }
    // Two jumps with travel in between.
    for _ in 0..2 {
        harness.step(
            MoveInput {
                jump: true,
                forward: 1.0,
                ..Default::default()
            },
            0.0,
        );
        for _ in 0..49 {
            harness.step(forward(), 0.0);
        }
    }
    // Idle settle.
    for _ in 0..40 {
        harness.step(idle(), 0.0);
    }
    // 80+80+2*50+40 = 300 ticks
}
