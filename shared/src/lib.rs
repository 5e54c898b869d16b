//! # Shared Simulation Library
//!
//! Everything that must behave identically on the map server and the
//! predicting client lives in this crate: the fixed-timestep kinematic
//! character controller, the deterministic platform timeline, the wire
//! protocol schema, the ability data model, and the persisted player
//! snapshot.
//!
//! ## Parity requirement
//!
//! The server steps the authoritative simulation and the client replays
//! its pending inputs through the *same* `kernel::step_player` with the
//! same constants. Any divergence between the two shows up as permanent
//! reconciliation error, so nothing in this crate may read wall-clock
//! time, random state, or iteration order of unordered containers.
//!
//! ## Serialization
//!
//! All wire types implement `Serialize`/`Deserialize` and are encoded
//! with `bincode` for transmission over the map transport. Orchestrator
//! HTTP bodies use JSON; `snapshot::PlayerSnapshot` is shared between
//! both encodings.

use serde::{Deserialize, Serialize};

pub mod abilities;
pub mod kernel;
pub mod map;
pub mod math;
pub mod protocol;
pub mod snapshot;
pub mod world;

pub use kernel::movement::MoveInput;
pub use kernel::platforms::{PlatformDef, PlatformIndex, PlatformMotion, PlatformPose};
pub use kernel::step::{KinematicState, StepContext};
pub use protocol::{InputAck, InputCommand, Message};
pub use snapshot::PlayerSnapshot;
pub use world::{Collider, Vec3};

/// Per-connection network id. Recycled when the connection closes;
/// also used to address non-player entities in the replication stream.
pub type Nid = u16;

/// Platform definition id, stable across sessions.
pub type Pid = u16;

/// Fixed simulation rate shared by server tick loop and client predictor.
pub const TICK_RATE: u32 = 60;

/// Canonical fixed timestep in seconds.
pub const FIXED_DT: f32 = 1.0 / TICK_RATE as f32;

/// Shortest step the kernel will integrate; larger deltas are clamped,
/// never dropped.
pub const MIN_TICK_DT: f32 = 1.0 / 120.0;

/// Longest step the kernel will integrate.
pub const MAX_TICK_DT: f32 = 1.0 / 20.0;

/// Downward gravitational acceleration in units/second².
///
/// Applied only while airborne; grounded bodies keep `vy = 0` so that
/// platform carry fully owns their vertical motion.
pub const GRAVITY: f32 = 22.0;

/// Upward velocity applied on the tick a grounded jump fires.
pub const JUMP_VELOCITY: f32 = 7.5;

/// Target walking speed on the ground, units/second.
pub const GROUND_SPEED: f32 = 4.5;

/// Sprint scales the target ground speed.
pub const SPRINT_MULTIPLIER: f32 = 1.6;

/// Acceleration toward the target velocity while grounded.
pub const GROUND_ACCEL: f32 = 40.0;

/// Reduced acceleration while airborne (air control).
pub const AIR_ACCEL: f32 = 8.0;

/// Vertical speed used by the flying movement mode.
pub const FLY_SPEED: f32 = 5.0;

/// Player capsule radius.
pub const CAPSULE_RADIUS: f32 = 0.35;

/// Half-length of the capsule's cylindrical section (total height is
/// `2 * (CAPSULE_HALF_HEIGHT + CAPSULE_RADIUS)`).
pub const CAPSULE_HALF_HEIGHT: f32 = 0.55;

/// Maximum downward snap distance that keeps a walking body glued to
/// ground it would otherwise skip off.
pub const GROUND_SNAP_DISTANCE: f32 = 0.2;

/// Steepest slope (degrees from horizontal) that still counts as ground.
pub const MAX_CLIMB_SLOPE_DEG: f32 = 60.0;

/// Slopes at or beyond this angle never arrest a fall.
pub const MIN_SLIDE_SLOPE_DEG: f32 = 80.0;

/// Base vertical tolerance when matching a platform top to the foot.
pub const PLATFORM_FOOT_TOLERANCE: f32 = 0.25;

/// Widened tolerance for the currently-preferred platform (hysteresis
/// against chatter between adjacent platforms).
pub const PLATFORM_PREFERRED_TOLERANCE: f32 = 0.45;

/// A platform whose top is more than this far above the foot is rejected
/// outright.
pub const PLATFORM_MAX_ABOVE_FOOT: f32 = 0.20;

/// Positional reconciliation error beyond which the client snaps instead
/// of smoothing.
pub const HARD_SNAP_DISTANCE: f32 = 2.5;

/// Yaw reconciliation error beyond which the client snaps.
pub const HARD_SNAP_YAW: f32 = 0.75 * std::f32::consts::PI;

/// Exponential decay rate of the reconciliation smoothing offset, 1/s.
pub const SMOOTHING_RATE: f32 = 14.0;

/// Default player health.
pub const PLAYER_MAX_HEALTH: i32 = 100;

/// Minimum XZ separation between fresh spawn positions.
pub const SPAWN_SEPARATION: f32 = 0.7;

/// How the vertical axis of a player is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementMode {
    /// Normal gravity-bound locomotion.
    Grounded,
    /// No gravity; jump input ascends at `FLY_SPEED`.
    Flying,
}

impl Default for MovementMode {
    fn default() -> Self {
        MovementMode::Grounded
    }
}
