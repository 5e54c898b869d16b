//! Persisted player snapshot carried across map transfers.

use crate::{KinematicState, MovementMode, PLAYER_MAX_HEALTH};
use serde::{Deserialize, Serialize};

/// Everything a destination map needs to restore a transferring player.
///
/// Serialized as JSON into the orchestrator's ticket/snapshot storage,
/// so field names are part of the persistence contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub yaw: f32,
    pub pitch: f32,
    pub vx: f32,
    pub vy: f32,
    pub vz: f32,
    pub health: i32,
    pub primary_mouse_slot: u8,
    pub secondary_mouse_slot: u8,
    pub hotbar_ability_ids: [u16; 10],
}

impl PlayerSnapshot {
    /// Snapshot for a brand-new account.
    pub fn fresh() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            yaw: 0.0,
            pitch: 0.0,
            vx: 0.0,
            vy: 0.0,
            vz: 0.0,
            health: PLAYER_MAX_HEALTH,
            primary_mouse_slot: 0,
            secondary_mouse_slot: 1,
            hotbar_ability_ids: [0; 10],
        }
    }

    pub fn from_state(state: &KinematicState, health: i32, primary: u8, secondary: u8, hotbar: [u16; 10]) -> Self {
        Self {
            x: state.position[0],
            y: state.position[1],
            z: state.position[2],
            yaw: state.yaw,
            pitch: state.pitch,
            vx: state.velocity[0],
            vy: state.velocity[1],
            vz: state.velocity[2],
            health,
            primary_mouse_slot: primary,
            secondary_mouse_slot: secondary,
            hotbar_ability_ids: hotbar,
        }
    }

    /// Rebuilds kinematic state; grounding is re-derived on the first
    /// step in the destination map.
    pub fn to_state(&self) -> KinematicState {
        KinematicState {
            position: [self.x, self.y, self.z],
            velocity: [self.vx, self.vy, self.vz],
            yaw: self.yaw,
            pitch: self.pitch,
            grounded: false,
            grounded_platform_pid: None,
            mode: MovementMode::Grounded,
        }
    }
}
