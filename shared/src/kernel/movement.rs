//! Horizontal movement model: pure velocity shaping from input.

use crate::math::{sanitize_axis, yaw_forward, yaw_right};
use crate::world::Vec3;
use crate::{AIR_ACCEL, GROUND_ACCEL, GROUND_SPEED, SPRINT_MULTIPLIER};
use serde::{Deserialize, Serialize};

/// One fixed step worth of movement intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MoveInput {
    /// Forward axis in `[-1, 1]` (positive walks toward the view yaw).
    pub forward: f32,
    /// Strafe axis in `[-1, 1]` (positive strafes right).
    pub strafe: f32,
    pub jump: bool,
    pub sprint: bool,
}

impl MoveInput {
    /// Returns a copy with both axes clamped and NaN-free.
    pub fn sanitized(&self) -> MoveInput {
        MoveInput {
            forward: sanitize_axis(self.forward),
            strafe: sanitize_axis(self.strafe),
            jump: self.jump,
            sprint: self.sprint,
        }
    }
}

/// Accelerates the horizontal velocity toward the input's target velocity.
///
/// Pure vector transform: never reads physics world state. The target is
/// the yaw-rotated input direction scaled by ground speed (and sprint);
/// grounded bodies approach it at `GROUND_ACCEL`, airborne bodies at the
/// reduced `AIR_ACCEL`. The vertical component passes through untouched.
pub fn step_horizontal_movement(v_prev: Vec3, input: &MoveInput, yaw: f32, grounded: bool, dt: f32) -> Vec3 {
    let input = input.sanitized();

    let mut wish = yaw_forward(yaw) * input.forward + yaw_right(yaw) * input.strafe;
    let wish_len = wish.norm();
    if wish_len > 1.0 {
        wish /= wish_len;
    }

    let mut target_speed = GROUND_SPEED;
    if input.sprint {
        target_speed *= SPRINT_MULTIPLIER;
    }
    let target = wish * target_speed;

    let accel = if grounded { GROUND_ACCEL } else { AIR_ACCEL };
    let max_delta = accel * dt;

    let current = Vec3::new(v_prev.x, 0.0, v_prev.z);
    let diff = target - current;
    let diff_len = diff.norm();
    let horizontal = if diff_len <= max_delta || diff_len <= f32::EPSILON {
        target
    } else {
        current + diff * (max_delta / diff_len)
    };

    Vec3::new(horizontal.x, v_prev.y, horizontal.z)
}
