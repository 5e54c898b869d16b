//! Deterministic moving-platform timeline, rigid carry, and grounded
//! platform selection.
//!
//! A platform's pose is a pure function of simulation time, so server and
//! client evaluate it independently and the ack never needs to replicate
//! platform state beyond `grounded_platform_pid`.

use crate::math::normalize_yaw;
use crate::world::{iso_at_yaw, Collider, Vec3};
use crate::{Pid, PLATFORM_FOOT_TOLERANCE, PLATFORM_MAX_ABOVE_FOOT, PLATFORM_PREFERRED_TOLERANCE};
use serde::{Deserialize, Serialize};

/// Time→pose law of a platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum PlatformMotion {
    /// Sinusoidal translation along `axis` around `origin`.
    Linear {
        origin: [f32; 3],
        axis: [f32; 3],
        amplitude: f32,
        period: f32,
    },
    /// Constant-rate yaw spin about `origin`.
    Rotating { origin: [f32; 3], yaw_rate: f32 },
}

/// Static platform definition; never mutated at runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlatformDef {
    pub pid: Pid,
    pub half_extents: [f32; 3],
    pub motion: PlatformMotion,
}

/// Pose of a platform at a point in simulation time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlatformPose {
    pub position: Vec3,
    pub yaw: f32,
}

impl PlatformDef {
    /// Samples the deterministic pose at simulation time `t` (seconds).
    pub fn sample(&self, t: f64) -> PlatformPose {
        match self.motion {
            PlatformMotion::Linear {
                origin,
                axis,
                amplitude,
                period,
            } => {
                let phase = if period > 0.0 {
                    (t * std::f64::consts::TAU / period as f64).sin() as f32
                } else {
                    0.0
                };
                let origin = Vec3::new(origin[0], origin[1], origin[2]);
                let axis = Vec3::new(axis[0], axis[1], axis[2]);
                PlatformPose {
                    position: origin + axis * (amplitude * phase),
                    yaw: 0.0,
                }
            }
            PlatformMotion::Rotating { origin, yaw_rate } => PlatformPose {
                position: Vec3::new(origin[0], origin[1], origin[2]),
                yaw: normalize_yaw((yaw_rate as f64 * t) as f32),
            },
        }
    }

    /// Collider for this platform at time `t`.
    pub fn collider(&self, t: f64) -> Collider {
        let pose = self.sample(t);
        Collider::Cuboid {
            half_extents: Vec3::new(
                self.half_extents[0],
                self.half_extents[1],
                self.half_extents[2],
            ),
            iso: iso_at_yaw(pose.position, pose.yaw),
        }
    }
}

/// Carries a body through the rigid transform delta of its supporting
/// platform: rotate about the platform origin by the yaw delta, then
/// translate. Returns the moved position and the (normalized) yaw delta
/// the body should add to its own orientation.
pub fn apply_platform_carry(prev: &PlatformPose, cur: &PlatformPose, body_pos: Vec3) -> (Vec3, f32) {
    let yaw_delta = normalize_yaw(cur.yaw - prev.yaw);

    let local = body_pos - prev.position;
    let (s, c) = (yaw_delta.sin(), yaw_delta.cos());
    let rotated = Vec3::new(local.x * c + local.z * s, local.y, -local.x * s + local.z * c);

    (cur.position + rotated, yaw_delta)
}

/// Immutable set of platform definitions with XZ lookup.
#[derive(Debug, Clone, Default)]
pub struct PlatformIndex {
    defs: Vec<PlatformDef>,
}

impl PlatformIndex {
    pub fn new(mut defs: Vec<PlatformDef>) -> Self {
        defs.sort_by_key(|d| d.pid);
        Self { defs }
    }

    pub fn get(&self, pid: Pid) -> Option<&PlatformDef> {
        self.defs.iter().find(|d| d.pid == pid)
    }

    pub fn defs(&self) -> &[PlatformDef] {
        &self.defs
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Colliders for every platform at time `t`, in pid order.
    pub fn colliders_at(&self, t: f64) -> Vec<Collider> {
        self.defs.iter().map(|d| d.collider(t)).collect()
    }

    /// True if `pos` lies over the platform's (yaw-rotated) XZ footprint,
    /// inflated by `margin`.
    fn footprint_contains(def: &PlatformDef, pose: &PlatformPose, pos: Vec3, margin: f32) -> bool {
        let local = pos - pose.position;
        let (s, c) = (pose.yaw.sin(), pose.yaw.cos());
        let lx = local.x * c - local.z * s;
        let lz = local.x * s + local.z * c;
        lx.abs() <= def.half_extents[0] + margin && lz.abs() <= def.half_extents[2] + margin
    }

    /// Selects the platform supporting a foot position at time `t`.
    ///
    /// The winner is the platform whose top surface is vertically closest
    /// to the foot within the tolerance window. `preferred` (the platform
    /// the body stood on last step) gets a widened window, which gives
    /// hysteresis where two platforms meet. Platforms whose top is more
    /// than `PLATFORM_MAX_ABOVE_FOOT` above the foot never match.
    pub fn find_grounded_platform(&self, t: f64, foot: Vec3, preferred: Option<Pid>) -> Option<Pid> {
        let mut best: Option<(Pid, f32)> = None;

        for def in &self.defs {
            let pose = def.sample(t);
            if !Self::footprint_contains(def, &pose, foot, 0.05) {
                continue;
            }

            let top_y = pose.position.y + def.half_extents[1];
            let gap = top_y - foot.y;
            if gap > PLATFORM_MAX_ABOVE_FOOT {
                continue;
            }

            let tolerance = if preferred == Some(def.pid) {
                PLATFORM_PREFERRED_TOLERANCE
            } else {
                PLATFORM_FOOT_TOLERANCE
            };
            if gap.abs() > tolerance {
                continue;
            }

            if best.map_or(true, |(_, d)| gap.abs() < d) {
                best = Some((def.pid, gap.abs()));
            }
        }

        best.map(|(pid, _)| pid)
    }
}
