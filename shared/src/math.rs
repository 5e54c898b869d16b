//! Small math helpers shared by the kernel and the netcode.

use crate::world::Vec3;
use std::f32::consts::PI;

/// Normalizes an angle to the half-open interval `(-PI, PI]`.
pub fn normalize_yaw(yaw: f32) -> f32 {
    if !yaw.is_finite() {
        return 0.0;
    }
    let mut y = yaw % (2.0 * PI);
    if y <= -PI {
        y += 2.0 * PI;
    } else if y > PI {
        y -= 2.0 * PI;
    }
    y
}

/// Shortest signed difference `b - a` between two yaw angles.
pub fn yaw_difference(b: f32, a: f32) -> f32 {
    normalize_yaw(b - a)
}

/// Circular ordering for wrapping u16 input sequences.
///
/// `b` is strictly ahead of `a` iff `(b - a) mod 2^16` lies in
/// `(0, 2^15)`. Used everywhere a sequence comparison happens so the
/// stream survives wraparound.
pub fn sequence_ahead(b: u16, a: u16) -> bool {
    let d = b.wrapping_sub(a);
    d != 0 && d < 0x8000
}

/// Replaces a non-finite scalar with a fallback.
pub fn sanitize(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Replaces non-finite vector components with zero.
pub fn sanitize_vec(v: Vec3) -> Vec3 {
    Vec3::new(sanitize(v.x, 0.0), sanitize(v.y, 0.0), sanitize(v.z, 0.0))
}

/// Clamps an input axis to `[-1, 1]`, mapping non-finite values to zero.
pub fn sanitize_axis(value: f32) -> f32 {
    sanitize(value, 0.0).clamp(-1.0, 1.0)
}

/// World-space forward vector in the XZ plane for a yaw angle.
pub fn yaw_forward(yaw: f32) -> Vec3 {
    Vec3::new(yaw.sin(), 0.0, yaw.cos())
}

/// World-space right vector in the XZ plane for a yaw angle.
pub fn yaw_right(yaw: f32) -> Vec3 {
    Vec3::new(yaw.cos(), 0.0, -yaw.sin())
}

/// Full 3D view direction from yaw and pitch (pitch positive looks up).
pub fn view_direction(yaw: f32, pitch: f32) -> Vec3 {
    let cp = pitch.cos();
    Vec3::new(yaw.sin() * cp, pitch.sin(), yaw.cos() * cp)
}
