//! Input sampling and command building.
//!
//! Movement state is set by the embedding layer (input devices are an
//! external collaborator) or by the test hooks; both primary-action
//! paths feed one pressed-edge queue, so a single call enqueues exactly
//! one edge no matter which path fired.

use shared::math::normalize_yaw;
use shared::protocol::InputCommand;
use shared::MoveInput;
use std::collections::VecDeque;

/// Pressed edges buffered beyond this are discarded.
const MAX_PENDING_EDGES: usize = 8;

/// Builds one sequenced `InputCommand` per fixed step.
pub struct InputSampler {
    next_sequence: u16,
    movement: MoveInput,
    yaw: f32,
    pitch: f32,
    pending_yaw_delta: f32,
    primary_edges: VecDeque<()>,
    primary_held: bool,
}

impl InputSampler {
    pub fn new() -> Self {
        Self {
            next_sequence: 1,
            movement: MoveInput::default(),
            yaw: 0.0,
            pitch: 0.0,
            pending_yaw_delta: 0.0,
            primary_edges: VecDeque::new(),
            primary_held: false,
        }
    }

    pub fn set_movement(&mut self, movement: MoveInput) {
        self.movement = movement;
    }

    pub fn movement(&self) -> MoveInput {
        self.movement
    }

    /// Applies a look delta; yaw stays normalized.
    pub fn add_look(&mut self, yaw_delta: f32, pitch_delta: f32) {
        self.yaw = normalize_yaw(self.yaw + yaw_delta);
        self.pending_yaw_delta += yaw_delta;
        self.pitch = (self.pitch + pitch_delta).clamp(
            -std::f32::consts::FRAC_PI_2,
            std::f32::consts::FRAC_PI_2,
        );
    }

    pub fn set_orientation(&mut self, yaw: f32, pitch: f32) {
        self.yaw = normalize_yaw(yaw);
        self.pitch = pitch.clamp(-std::f32::consts::FRAC_PI_2, std::f32::consts::FRAC_PI_2);
    }

    /// External carry (rotating platform) adjusts the view yaw without
    /// counting as player look input.
    pub fn carry_yaw(&mut self, yaw: f32) {
        self.yaw = normalize_yaw(yaw);
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    /// Enqueues exactly one primary pressed-edge.
    pub fn trigger_primary(&mut self) {
        if self.primary_edges.len() < MAX_PENDING_EDGES {
            self.primary_edges.push_back(());
        }
    }

    pub fn set_primary_held(&mut self, held: bool) {
        self.primary_held = held;
    }

    /// Produces the next sequenced command, consuming at most one
    /// pressed-edge.
    pub fn next_command(&mut self) -> InputCommand {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let primary_pressed = self.primary_edges.pop_front().is_some();
        let yaw_delta = self.pending_yaw_delta;
        self.pending_yaw_delta = 0.0;

        InputCommand {
            sequence,
            forward: self.movement.forward,
            strafe: self.movement.strafe,
            jump: self.movement.jump,
            sprint: self.movement.sprint,
            primary_pressed,
            primary_held: self.primary_held || primary_pressed,
            yaw: self.yaw,
            yaw_delta,
            pitch: self.pitch,
        }
    }
}

impl Default for InputSampler {
    fn default() -> Self {
        Self::new()
    }
}
