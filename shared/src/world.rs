//! Static collision world and shape-cast queries.
//!
//! The physics world only ever contains planes, axis-placed cuboids,
//! spheres and capsules. Queries are time-of-impact sweeps via parry3d;
//! a linear AABB prefilter stands in for a broad phase, which is plenty
//! for worlds of a few dozen colliders.

use nalgebra as na;
use parry3d::bounding_volume::Aabb;
use parry3d::query::{self, ShapeCastOptions};
use parry3d::shape::{Ball, Capsule, Cuboid, HalfSpace, Shape};

pub type Vec3 = na::Vector3<f32>;
pub type Quat = na::UnitQuaternion<f32>;
pub type Iso = na::Isometry3<f32>;

/// Separation kept from surfaces after a sweep stops, to avoid jitter.
pub const CONTACT_SKIN: f32 = 0.01;

/// Maximum slide iterations per kinematic move (corner handling).
pub const MAX_SLIDE_ITERATIONS: u32 = 4;

/// Moves shorter than this are ignored.
pub const MIN_MOVE: f32 = 1.0e-5;

#[inline]
pub fn iso_at(p: Vec3) -> Iso {
    Iso::from_parts(na::Translation3::new(p.x, p.y, p.z), Quat::identity())
}

#[inline]
pub fn iso_at_yaw(p: Vec3, yaw: f32) -> Iso {
    Iso::from_parts(
        na::Translation3::new(p.x, p.y, p.z),
        Quat::from_axis_angle(&Vec3::y_axis(), yaw),
    )
}

/// A static collision shape placed in the world.
#[derive(Clone, Copy, Debug)]
pub enum Collider {
    /// Infinite plane satisfying `normal ⋅ x = dist`.
    Plane { normal: Vec3, dist: f32 },
    /// Box with local half-extents, posed by `iso`.
    Cuboid { half_extents: Vec3, iso: Iso },
    /// Sphere; rotation is irrelevant.
    Sphere { radius: f32, center: Vec3 },
    /// Y-aligned capsule posed by `iso`.
    Capsule {
        radius: f32,
        half_height: f32,
        iso: Iso,
    },
}

impl Collider {
    /// World-space AABB, or `None` for infinite shapes.
    pub fn aabb(&self) -> Option<Aabb> {
        match *self {
            Collider::Plane { .. } => None,
            Collider::Cuboid { half_extents, iso } => Some(Cuboid::new(half_extents).aabb(&iso)),
            Collider::Sphere { radius, center } => Some(Ball::new(radius).aabb(&iso_at(center))),
            Collider::Capsule {
                radius,
                half_height,
                iso,
            } => Some(Capsule::new_y(half_height, radius).aabb(&iso)),
        }
    }
}

/// First contact of a swept shape.
#[derive(Clone, Copy, Debug)]
pub struct CastHit {
    /// Fraction of the tested translation at which contact occurs.
    pub fraction: f32,
    /// Contact normal on the moving shape, flipped to oppose the motion.
    pub normal: Vec3,
    /// Index of the collider that was hit.
    pub collider: usize,
}

/// Result of a kinematic sweep-and-slide move.
#[derive(Clone, Copy, Debug)]
pub struct MoveOutcome {
    /// Final shape center after sliding.
    pub end_pos: Vec3,
    /// Last surface contacted during the move, if any.
    pub last_hit: Option<CastHit>,
}

fn cast_pair(
    moving_iso: &Iso,
    moving: &dyn Shape,
    vel: Vec3,
    max_toi: f32,
    target_iso: &Iso,
    target: &dyn Shape,
) -> Option<(f32, Vec3)> {
    let mut opts = ShapeCastOptions::with_max_time_of_impact(max_toi);
    opts.stop_at_penetration = true;
    let hit = query::cast_shapes(
        moving_iso,
        &vel,
        moving,
        target_iso,
        &na::Vector3::zeros(),
        target,
        opts,
    )
    .ok()??;
    let mut n = Vec3::new(
        hit.normal1.into_inner().x,
        hit.normal1.into_inner().y,
        hit.normal1.into_inner().z,
    );
    if n.dot(&vel) > 0.0 {
        n = -n;
    }
    Some((hit.time_of_impact, n))
}

/// Casts a moving shape against a single collider.
pub fn cast_shape_against(
    moving_iso: &Iso,
    moving: &dyn Shape,
    vel: Vec3,
    max_toi: f32,
    collider: &Collider,
) -> Option<(f32, Vec3)> {
    match *collider {
        Collider::Plane { normal, dist } => {
            let unit_n = na::Unit::new_normalize(normal);
            let plane = HalfSpace { normal: unit_n };
            let plane_iso = iso_at(normal * dist);
            cast_pair(moving_iso, moving, vel, max_toi, &plane_iso, &plane)
        }
        Collider::Cuboid { half_extents, iso } => {
            let cuboid = Cuboid::new(half_extents);
            cast_pair(moving_iso, moving, vel, max_toi, &iso, &cuboid)
        }
        Collider::Sphere { radius, center } => {
            let ball = Ball::new(radius);
            cast_pair(moving_iso, moving, vel, max_toi, &iso_at(center), &ball)
        }
        Collider::Capsule {
            radius,
            half_height,
            iso,
        } => {
            let capsule = Capsule::new_y(half_height, radius);
            cast_pair(moving_iso, moving, vel, max_toi, &iso, &capsule)
        }
    }
}

/// Swept AABB of a Y-aligned capsule moving by `desired`, inflated by
/// `margin` to keep near misses in the candidate set.
pub fn swept_capsule_aabb(half_height: f32, radius: f32, start: Vec3, desired: Vec3, margin: f32) -> Aabb {
    let capsule = Capsule::new_y(half_height, radius);
    let a = capsule.aabb(&iso_at(start));
    let b = capsule.aabb(&iso_at(start + desired));
    let mut mins = na::Point3::new(
        a.mins.x.min(b.mins.x),
        a.mins.y.min(b.mins.y),
        a.mins.z.min(b.mins.z),
    );
    let mut maxs = na::Point3::new(
        a.maxs.x.max(b.maxs.x),
        a.maxs.y.max(b.maxs.y),
        a.maxs.z.max(b.maxs.z),
    );
    mins -= Vec3::new(margin, margin, margin);
    maxs += Vec3::new(margin, margin, margin);
    Aabb { mins, maxs }
}

fn aabb_overlaps(a: &Aabb, b: &Aabb) -> bool {
    !(a.maxs.x < b.mins.x
        || a.mins.x > b.maxs.x
        || a.maxs.y < b.mins.y
        || a.mins.y > b.maxs.y
        || a.maxs.z < b.mins.z
        || a.mins.z > b.maxs.z)
}

/// Earliest capsule hit against a collider set, skipping `exclude`.
///
/// Planes are always tested; finite shapes are prefiltered by AABB
/// overlap with the swept capsule volume.
pub fn earliest_capsule_hit(
    colliders: &[Collider],
    half_height: f32,
    radius: f32,
    start: Vec3,
    vel: Vec3,
    max_toi: f32,
    exclude: Option<usize>,
) -> Option<CastHit> {
    let capsule = Capsule::new_y(half_height, radius);
    let capsule_iso = iso_at(start);
    let swept = swept_capsule_aabb(half_height, radius, start, vel * max_toi, CONTACT_SKIN);

    let mut best: Option<CastHit> = None;
    for (i, c) in colliders.iter().enumerate() {
        if Some(i) == exclude {
            continue;
        }
        if let Some(aabb) = c.aabb() {
            if !aabb_overlaps(&aabb, &swept) {
                continue;
            }
        }
        if let Some((fraction, normal)) =
            cast_shape_against(&capsule_iso, &capsule, vel, max_toi, c)
        {
            if best.map_or(true, |b| fraction < b.fraction) {
                best = Some(CastHit {
                    fraction,
                    normal,
                    collider: i,
                });
            }
        }
    }
    best
}

/// Earliest sphere hit against a collider set (projectiles, melee LOS).
pub fn earliest_sphere_hit(
    colliders: &[Collider],
    radius: f32,
    start: Vec3,
    vel: Vec3,
    max_toi: f32,
    exclude: Option<usize>,
) -> Option<CastHit> {
    let ball = Ball::new(radius);
    let ball_iso = iso_at(start);

    let mut best: Option<CastHit> = None;
    for (i, c) in colliders.iter().enumerate() {
        if Some(i) == exclude {
            continue;
        }
        if let Some((fraction, normal)) = cast_shape_against(&ball_iso, &ball, vel, max_toi, c) {
            if best.map_or(true, |b| fraction < b.fraction) {
                best = Some(CastHit {
                    fraction,
                    normal,
                    collider: i,
                });
            }
        }
    }
    best
}

/// Kinematic sweep-and-slide for the player capsule.
///
/// Shape-casts along the desired translation, stops at contact minus
/// `CONTACT_SKIN`, removes the normal component from the leftover and
/// iterates so corners resolve instead of sticking.
pub fn sweep_capsule(
    colliders: &[Collider],
    half_height: f32,
    radius: f32,
    start: Vec3,
    desired: Vec3,
) -> MoveOutcome {
    let mut pos = start;
    let mut remaining = desired;
    let mut last_hit = None;

    for _ in 0..MAX_SLIDE_ITERATIONS {
        let len = remaining.norm();
        if len <= MIN_MOVE {
            break;
        }
        let dir = remaining / len;

        match earliest_capsule_hit(colliders, half_height, radius, pos, remaining, 1.0, None) {
            None => {
                pos += remaining;
                break;
            }
            Some(hit) => {
                let travel = (len * hit.fraction - CONTACT_SKIN).max(0.0);
                pos += dir * travel;

                let leftover = dir * (len - travel);
                let n = hit.normal;
                let slide = leftover - n * leftover.dot(&n);
                remaining = slide;
                last_hit = Some(hit);
            }
        }
    }

    MoveOutcome {
        end_pos: pos,
        last_hit,
    }
}

/// Sweeps the capsule straight down and returns the ground contact if it
/// lies within `max_snap`. The returned position rests the capsule at
/// contact minus skin; the caller decides whether the surface counts as
/// ground (slope limits live in the kernel).
pub fn probe_ground(
    colliders: &[Collider],
    half_height: f32,
    radius: f32,
    pos: Vec3,
    max_snap: f32,
) -> Option<(Vec3, CastHit)> {
    if max_snap <= 0.0 {
        return None;
    }
    let down = Vec3::new(0.0, -max_snap, 0.0);
    let hit = earliest_capsule_hit(colliders, half_height, radius, pos, down, 1.0, None)?;
    let travel = (max_snap * hit.fraction - CONTACT_SKIN).max(0.0);
    Some((pos + Vec3::new(0.0, -travel, 0.0), hit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn floor() -> Collider {
        Collider::Plane {
            normal: Vec3::new(0.0, 1.0, 0.0),
            dist: 0.0,
        }
    }

    fn wall_at_x(x: f32) -> Collider {
        Collider::Cuboid {
            half_extents: Vec3::new(0.5, 5.0, 5.0),
            iso: iso_at(Vec3::new(x, 5.0, 0.0)),
        }
    }

    #[test]
    fn test_sweep_free_space_moves_fully() {
        let world = [floor()];
        let out = sweep_capsule(&world, 0.55, 0.35, Vec3::new(0.0, 2.0, 0.0), Vec3::new(1.0, 0.0, 0.0));
        assert_approx_eq!(out.end_pos.x, 1.0, 1e-4);
        assert!(out.last_hit.is_none());
    }

    #[test]
    fn test_sweep_stops_at_wall() {
        let world = [floor(), wall_at_x(2.0)];
        let out = sweep_capsule(&world, 0.55, 0.35, Vec3::new(0.0, 1.0, 0.0), Vec3::new(5.0, 0.0, 0.0));
        // Capsule radius 0.35 + wall half extent 0.5 around x=2.0
        assert!(out.end_pos.x < 2.0 - 0.5 - 0.35 + 0.05);
        assert!(out.last_hit.is_some());
    }

    #[test]
    fn test_sweep_slides_along_wall() {
        let world = [floor(), wall_at_x(2.0)];
        let out = sweep_capsule(
            &world,
            0.55,
            0.35,
            Vec3::new(0.5, 1.0, 0.0),
            Vec3::new(3.0, 0.0, 2.0),
        );
        // Blocked in X but the Z component survives the slide.
        assert!(out.end_pos.z > 1.5);
    }

    #[test]
    fn test_probe_ground_finds_floor() {
        let world = [floor()];
        let start = Vec3::new(0.0, 1.0, 0.0);
        let (snapped, hit) = probe_ground(&world, 0.55, 0.35, start, 0.2).expect("within range");
        assert!(snapped.y < start.y);
        assert!(hit.normal.y > 0.9);
    }

    #[test]
    fn test_probe_ground_out_of_range() {
        let world = [floor()];
        // Capsule bottom is ~2.1 above the floor, beyond the 0.2 snap.
        assert!(probe_ground(&world, 0.55, 0.35, Vec3::new(0.0, 3.0, 0.0), 0.2).is_none());
    }

    #[test]
    fn test_sphere_cast_hits_capsule_target() {
        let target = Collider::Capsule {
            radius: 0.35,
            half_height: 0.55,
            iso: iso_at(Vec3::new(3.0, 1.0, 0.0)),
        };
        let hit = earliest_sphere_hit(
            &[target],
            0.1,
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(10.0, 0.0, 0.0),
            1.0,
            None,
        )
        .expect("should hit");
        assert!(hit.fraction > 0.0 && hit.fraction < 1.0);
    }

    #[test]
    fn test_exclude_skips_collider() {
        let target = Collider::Sphere {
            radius: 0.5,
            center: Vec3::new(2.0, 0.0, 0.0),
        };
        let hit = earliest_sphere_hit(
            &[target],
            0.1,
            Vec3::zeros(),
            Vec3::new(5.0, 0.0, 0.0),
            1.0,
            Some(0),
        );
        assert!(hit.is_none());
    }
}
