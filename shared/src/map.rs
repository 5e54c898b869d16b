//! Seeded static map layout.
//!
//! Same seed, same layout: the generator draws everything from a seeded
//! RNG in a fixed order, and `layout_hash` digests the result so tests
//! (and the orchestrator health surface) can verify determinism.

use crate::kernel::platforms::{PlatformDef, PlatformMotion};
use crate::world::{iso_at, Collider, Vec3};
use crate::PlatformIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

/// Radius of the spawn ring. Sixteen points on this ring are ~1.17 units
/// apart, comfortably above the 0.7 spawn-separation floor.
const SPAWN_RING_RADIUS: f32 = 3.0;
const SPAWN_RING_POINTS: usize = 16;

/// Immutable world description for one map instance.
#[derive(Debug, Clone)]
pub struct MapLayout {
    pub seed: u64,
    pub world: Vec<Collider>,
    pub platforms: PlatformIndex,
    pub spawn_points: Vec<Vec3>,
    /// Dummy spawn position and facing yaw.
    pub dummy_spawns: Vec<(Vec3, f32)>,
}

impl MapLayout {
    pub fn generate(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let mut world = vec![Collider::Plane {
            normal: Vec3::new(0.0, 1.0, 0.0),
            dist: 0.0,
        }];

        // A handful of scattered prop boxes away from the spawn ring.
        let prop_count = rng.gen_range(3..6);
        for _ in 0..prop_count {
            let angle: f32 = rng.gen_range(0.0..std::f32::consts::TAU);
            let dist: f32 = rng.gen_range(8.0..14.0);
            let half: f32 = rng.gen_range(0.4..1.2);
            world.push(Collider::Cuboid {
                half_extents: Vec3::new(half, half, half),
                iso: iso_at(Vec3::new(angle.cos() * dist, half, angle.sin() * dist)),
            });
        }

        let platforms = PlatformIndex::new(vec![
            PlatformDef {
                pid: 1,
                half_extents: [2.0, 0.25, 2.0],
                motion: PlatformMotion::Linear {
                    origin: [6.0, 1.0, 0.0],
                    axis: [0.0, 0.0, 1.0],
                    amplitude: rng.gen_range(2.0..4.0),
                    period: rng.gen_range(6.0..10.0),
                },
            },
            PlatformDef {
                pid: 2,
                half_extents: [2.5, 0.25, 2.5],
                motion: PlatformMotion::Rotating {
                    origin: [-6.0, 1.0, 0.0],
                    yaw_rate: rng.gen_range(0.3..0.8),
                },
            },
        ]);

        let spawn_points = (0..SPAWN_RING_POINTS)
            .map(|i| {
                let angle = i as f32 / SPAWN_RING_POINTS as f32 * std::f32::consts::TAU;
                Vec3::new(
                    angle.cos() * SPAWN_RING_RADIUS,
                    crate::CAPSULE_HALF_HEIGHT + crate::CAPSULE_RADIUS + 0.01,
                    angle.sin() * SPAWN_RING_RADIUS,
                )
            })
            .collect();

        let dummy_spawns = vec![
            (Vec3::new(0.0, 1.0, 8.0), 0.0),
            (Vec3::new(0.0, 1.0, -8.0), std::f32::consts::PI),
        ];

        Self {
            seed,
            world,
            platforms,
            spawn_points,
            dummy_spawns,
        }
    }

    /// Hex digest over the canonical byte form of the layout.
    pub fn layout_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());

        let mut put_vec = |h: &mut Sha256, v: Vec3| {
            h.update(v.x.to_le_bytes());
            h.update(v.y.to_le_bytes());
            h.update(v.z.to_le_bytes());
        };

        for c in &self.world {
            match *c {
                Collider::Plane { normal, dist } => {
                    hasher.update([0u8]);
                    put_vec(&mut hasher, normal);
                    hasher.update(dist.to_le_bytes());
                }
                Collider::Cuboid { half_extents, iso } => {
                    hasher.update([1u8]);
                    put_vec(&mut hasher, half_extents);
                    put_vec(&mut hasher, iso.translation.vector);
                }
                Collider::Sphere { radius, center } => {
                    hasher.update([2u8]);
                    hasher.update(radius.to_le_bytes());
                    put_vec(&mut hasher, center);
                }
                Collider::Capsule {
                    radius,
                    half_height,
                    iso,
                } => {
                    hasher.update([3u8]);
                    hasher.update(radius.to_le_bytes());
                    hasher.update(half_height.to_le_bytes());
                    put_vec(&mut hasher, iso.translation.vector);
                }
            }
        }

        for def in self.platforms.defs() {
            hasher.update(def.pid.to_le_bytes());
            for half in def.half_extents {
                hasher.update(half.to_le_bytes());
            }
            match def.motion {
                PlatformMotion::Linear {
                    origin,
                    axis,
                    amplitude,
                    period,
                } => {
                    hasher.update([0u8]);
                    for v in origin.iter().chain(axis.iter()) {
                        hasher.update(v.to_le_bytes());
                    }
                    hasher.update(amplitude.to_le_bytes());
                    hasher.update(period.to_le_bytes());
                }
                PlatformMotion::Rotating { origin, yaw_rate } => {
                    hasher.update([1u8]);
                    for v in origin {
                        hasher.update(v.to_le_bytes());
                    }
                    hasher.update(yaw_rate.to_le_bytes());
                }
            }
        }

        for (pos, yaw) in &self.dummy_spawns {
            put_vec(&mut hasher, *pos);
            hasher.update(yaw.to_le_bytes());
        }

        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}
