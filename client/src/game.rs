//! Client-side prediction and server reconciliation.
//!
//! The client steps its own player through the shared kernel the moment
//! an input is sampled, keeps the unacknowledged inputs in a bounded
//! ring, and on every ack rewinds to the authoritative state and
//! replays what the server has not yet seen. Reconciliation error is
//! either snapped (beyond the hard thresholds) or folded into a decaying
//! render offset.

use shared::kernel::step::step_player;
use shared::math::{sequence_ahead, yaw_difference};
use shared::protocol::InputAck;
use shared::world::{Collider, Vec3};
use shared::{
    KinematicState, MoveInput, PlatformIndex, PlatformMotion, Pid, StepContext, FIXED_DT,
    HARD_SNAP_DISTANCE, HARD_SNAP_YAW, SMOOTHING_RATE,
};
use std::collections::VecDeque;

/// Bounded pending-input ring capacity; two seconds of inputs at 60 Hz
/// is far beyond any survivable ack gap.
const PENDING_CAPACITY: usize = 128;

/// One predicted-but-unacknowledged input.
#[derive(Debug, Clone, Copy)]
pub struct PendingInput {
    pub sequence: u16,
    pub input: MoveInput,
    pub yaw: f32,
    pub pitch: f32,
}

/// How an ack was absorbed; exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Stale or non-ahead sequence; nothing happened.
    Ignored,
    /// Error folded into the smoothing offset.
    Smoothed,
    /// Error exceeded the hard thresholds; pose jumped.
    HardSnap,
}

fn rotate_y(v: Vec3, yaw: f32) -> Vec3 {
    let (s, c) = (yaw.sin(), yaw.cos());
    Vec3::new(v.x * c + v.z * s, v.y, -v.x * s + v.z * c)
}

/// Predicted local player simulation.
pub struct ClientSim {
    pub state: KinematicState,
    world: Vec<Collider>,
    platforms: PlatformIndex,
    pending: VecDeque<PendingInput>,
    last_ack_sequence: Option<u16>,
    /// Server tick the rewind base corresponds to; predicted inputs run
    /// at `base_tick + index` so platform sampling matches the server.
    base_tick: u64,
    /// Reconciliation error, stored in the frame of `smoothing_frame`.
    smoothing_offset: Vec3,
    /// Rotating platform whose local frame holds the offset, with the
    /// platform yaw captured at fold time.
    smoothing_frame: Option<(Pid, f32)>,
}

impl ClientSim {
    pub fn new(world: Vec<Collider>, platforms: PlatformIndex, server_tick: u64) -> Self {
        // Provisional standing pose; the first ack rewinds to the
        // authoritative spawn.
        let standing = Vec3::new(
            0.0,
            shared::CAPSULE_HALF_HEIGHT + shared::CAPSULE_RADIUS + 0.01,
            0.0,
        );
        Self {
            state: KinematicState::at_rest(standing),
            world,
            platforms,
            pending: VecDeque::new(),
            last_ack_sequence: None,
            base_tick: server_tick,
            smoothing_offset: Vec3::zeros(),
            smoothing_frame: None,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_ack_sequence(&self) -> Option<u16> {
        self.last_ack_sequence
    }

    /// Tick the next predicted input will be stepped at.
    pub fn predicted_tick(&self) -> u64 {
        self.base_tick + self.pending.len() as u64
    }

    fn step_at(&self, state: &KinematicState, input: &MoveInput, tick: u64) -> KinematicState {
        let ctx = StepContext {
            world: &self.world,
            platforms: &self.platforms,
            time: tick as f64 * FIXED_DT as f64,
            dt: FIXED_DT,
        };
        step_player(state, input, &ctx)
    }

    /// Pitch handling must match the server's command intake exactly.
    fn sanitized_pitch(pitch: f32) -> f32 {
        shared::math::sanitize(pitch, 0.0).clamp(
            -std::f32::consts::FRAC_PI_2,
            std::f32::consts::FRAC_PI_2,
        )
    }

    /// Applies one sampled input immediately and records it for replay.
    pub fn predict(&mut self, pending: PendingInput) {
        self.state.yaw = shared::math::normalize_yaw(pending.yaw);
        self.state.pitch = Self::sanitized_pitch(pending.pitch);
        self.state = self.step_at(&self.state, &pending.input, self.predicted_tick());

        if self.pending.len() >= PENDING_CAPACITY {
            self.pending.pop_front();
        }
        self.pending.push_back(pending);
    }

    fn state_from_ack(ack: &InputAck, template: &KinematicState) -> KinematicState {
        KinematicState {
            position: [ack.x, ack.y, ack.z],
            velocity: [ack.vx, ack.vy, ack.vz],
            yaw: template.yaw,
            pitch: template.pitch,
            grounded: ack.grounded,
            grounded_platform_pid: ack.grounded_platform_pid,
            mode: ack.movement_mode,
        }
    }

    /// Rewinds to the acked authoritative state and replays pending
    /// inputs. Returns how the resulting error was absorbed.
    pub fn apply_ack(&mut self, ack: &InputAck) -> ReconcileOutcome {
        if let Some(last) = self.last_ack_sequence {
            if !sequence_ahead(ack.sequence, last) {
                return ReconcileOutcome::Ignored;
            }
        }
        self.last_ack_sequence = Some(ack.sequence);

        // Drop everything the server has already consumed.
        while let Some(front) = self.pending.front() {
            if !sequence_ahead(front.sequence, ack.sequence) {
                self.pending.pop_front();
            } else {
                break;
            }
        }

        let pre_position = self.state.position_vec();
        let pre_yaw = self.state.yaw;

        // Rewind and replay through the same kernel the server ran.
        let mut replayed = Self::state_from_ack(ack, &self.state);
        self.base_tick = ack.server_tick;
        let mut tick = ack.server_tick;
        for pending in &self.pending {
            replayed.yaw = shared::math::normalize_yaw(pending.yaw);
            replayed.pitch = Self::sanitized_pitch(pending.pitch);
            replayed = self.step_at(&replayed, &pending.input, tick);
            tick += 1;
        }

        let error = pre_position - replayed.position_vec();
        let yaw_error = yaw_difference(pre_yaw, replayed.yaw).abs();
        self.state = replayed;

        if error.norm() > HARD_SNAP_DISTANCE || yaw_error > HARD_SNAP_YAW {
            self.smoothing_offset = Vec3::zeros();
            self.smoothing_frame = None;
            ReconcileOutcome::HardSnap
        } else {
            self.fold_error(error);
            ReconcileOutcome::Smoothed
        }
    }

    /// Folds a reconciliation error into the smoothing offset. While
    /// grounded on a rotating platform the offset lives in the
    /// platform's yaw frame so carry does not re-introduce drift.
    fn fold_error(&mut self, error: Vec3) {
        let rotating_pid = self.state.grounded_platform_pid.and_then(|pid| {
            self.platforms.get(pid).and_then(|def| match def.motion {
                PlatformMotion::Rotating { .. } => Some(pid),
                PlatformMotion::Linear { .. } => None,
            })
        });

        let world_offset = self.world_offset_at(self.predicted_tick());
        match rotating_pid {
            Some(pid) => {
                let yaw = self.platform_yaw(pid, self.predicted_tick());
                self.smoothing_offset = rotate_y(world_offset + error, -yaw);
                self.smoothing_frame = Some((pid, yaw));
            }
            None => {
                self.smoothing_offset = world_offset + error;
                self.smoothing_frame = None;
            }
        }
    }

    fn platform_yaw(&self, pid: Pid, tick: u64) -> f32 {
        self.platforms
            .get(pid)
            .map(|def| def.sample(tick as f64 * FIXED_DT as f64).yaw)
            .unwrap_or(0.0)
    }

    /// Current smoothing offset expressed in world space.
    fn world_offset_at(&self, tick: u64) -> Vec3 {
        match self.smoothing_frame {
            Some((pid, _)) => rotate_y(self.smoothing_offset, self.platform_yaw(pid, tick)),
            None => self.smoothing_offset,
        }
    }

    /// Exponentially decays the smoothing offset.
    pub fn decay_smoothing(&mut self, dt: f32) {
        let factor = (-SMOOTHING_RATE * dt).exp();
        self.smoothing_offset *= factor;
        if self.smoothing_offset.norm() < 1.0e-4 {
            self.smoothing_offset = Vec3::zeros();
            self.smoothing_frame = None;
        }
    }

    /// Pose handed to the renderer: predicted state plus the decaying
    /// reconciliation offset.
    pub fn render_position(&self) -> Vec3 {
        self.state.position_vec() + self.world_offset_at(self.predicted_tick())
    }

    pub fn smoothing_offset_norm(&self) -> f32 {
        self.smoothing_offset.norm()
    }

    /// Drops all pending prediction state (reconnect path).
    pub fn reset_pending(&mut self) {
        self.pending.clear();
        self.smoothing_offset = Vec3::zeros();
        self.smoothing_frame = None;
        self.last_ack_sequence = None;
    }
}
