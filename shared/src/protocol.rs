//! Wire protocol between the game client and a map instance.
//!
//! Every frame on the transport is one bincode-encoded [`Message`]. The
//! enum discriminant is the message type; payload fields are plain
//! scalars so the schema stays stable across platforms. Client→server
//! and server→client variants share the enum the way the connection
//! shares the socket: a peer that receives a variant it does not expect
//! drops it and logs at debug level.
//!
//! Reliability notes:
//! - `InputCommand.sequence` is a wrapping u16 ordered by the circular
//!   rule in [`crate::math::sequence_ahead`].
//! - `InputAck` is idempotent: it carries the full authoritative
//!   post-step state for the acked sequence, so lost or reordered acks
//!   never corrupt reconciliation.
//! - Entity replication is a per-user diff stream: `CreateEntity`
//!   carries the full slice, `UpdateEntity` only changed properties,
//!   `DeleteEntity` only the nid.

use crate::abilities::AbilityDefinition;
use crate::snapshot::PlayerSnapshot;
use crate::{MovementMode, Nid, Pid};
use serde::{Deserialize, Serialize};

/// One fixed step of client input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputCommand {
    /// Wrapping sequence number; one per fixed step.
    pub sequence: u16,
    pub forward: f32,
    pub strafe: f32,
    pub jump: bool,
    pub sprint: bool,
    /// Pressed-edge of the primary mouse action this step.
    pub primary_pressed: bool,
    /// Held state of the primary mouse action.
    pub primary_held: bool,
    pub yaw: f32,
    pub yaw_delta: f32,
    pub pitch: f32,
}

/// Authoritative post-step state for an acknowledged input sequence,
/// addressed only to the owning connection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputAck {
    pub sequence: u16,
    pub server_tick: u64,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub vx: f32,
    pub vy: f32,
    pub vz: f32,
    pub grounded: bool,
    pub grounded_platform_pid: Option<Pid>,
    pub movement_mode: MovementMode,
}

/// Kind tag for replicated entities; the client disambiguates by this
/// instead of a type hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelId {
    Player,
    TrainingDummy,
    Projectile,
    Platform,
}

/// Uniform replicated slice for every entity kind. Per-kind extras stay
/// `None` where they do not apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySlice {
    pub nid: Nid,
    pub model_id: ModelId,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub yaw: f32,
    pub grounded: bool,
    pub health: i32,
    pub max_health: i32,
    /// Platform binding, so the client can sample the shared timeline.
    pub pid: Option<Pid>,
    /// Owning connection for projectiles.
    pub owner_nid: Option<Nid>,
    /// Collision radius for projectiles.
    pub radius: Option<f32>,
}

/// A single changed property inside an `UpdateEntity` frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EntityProp {
    X(f32),
    Y(f32),
    Z(f32),
    Yaw(f32),
    Grounded(bool),
    Health(i32),
    MaxHealth(i32),
}

/// Loadout mutation commands sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LoadoutCommand {
    /// Assign an unlocked ability to a hotbar slot (0..9).
    SetHotbarSlot { slot: u8, ability_id: u16 },
    /// Bind the primary mouse button to a hotbar slot index.
    SetPrimarySlot { slot: u8 },
    /// Bind the secondary mouse button to a hotbar slot index.
    SetSecondarySlot { slot: u8 },
}

/// Field-at-a-time mutations of the server-side ability creator draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AbilityCreatorCommand {
    Open,
    SetName(String),
    SetCategory(crate::abilities::AbilityCategory),
    SetStat { stat: crate::abilities::StatKind, value: u8 },
    ToggleAttribute { bit: u8 },
    Submit,
    Cancel,
}

/// Canonical creator draft snapshot, emitted after every applied command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbilityCreatorState {
    pub open: bool,
    pub draft: AbilityDefinition,
    pub points_spent: u16,
    pub points_budget: u16,
    /// Rejection reason for the last command, if it failed validation.
    pub error: Option<String>,
}

/// Reason a join attempt was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinRefusal {
    TicketNotFound,
    TicketExpired,
    TicketAlreadyConsumed,
    MapInstanceMismatch,
    BadHandshake,
}

impl JoinRefusal {
    pub fn as_code(&self) -> &'static str {
        match self {
            JoinRefusal::TicketNotFound => "ticket_not_found",
            JoinRefusal::TicketExpired => "ticket_expired",
            JoinRefusal::TicketAlreadyConsumed => "ticket_already_consumed",
            JoinRefusal::MapInstanceMismatch => "map_instance_mismatch",
            JoinRefusal::BadHandshake => "bad_handshake",
        }
    }
}

/// All frames carried by the map transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // === Client → Server ===
    /// Handshake; must be the first frame on a fresh connection.
    Join {
        auth_version: u8,
        auth_key: Option<String>,
        join_ticket: Option<String>,
    },
    Input(InputCommand),
    Loadout(LoadoutCommand),
    Creator(AbilityCreatorCommand),
    /// Ask the orchestrator (via this map) for a transfer ticket.
    RequestMapTransfer { target_map_instance_id: String },
    Disconnect,

    // === Server → Client ===
    /// Sent once after a successful handshake.
    Identity {
        nid: Nid,
        account_id: String,
        map_instance_id: String,
        server_tick: u64,
    },
    JoinRefused { reason: JoinRefusal },
    Ack(InputAck),
    CreateEntity(EntitySlice),
    UpdateEntity { nid: Nid, props: Vec<EntityProp> },
    DeleteEntity { nid: Nid },
    AbilityDefinition(AbilityDefinition),
    AbilityOwnership { ability_ids_csv: String },
    AbilityState {
        primary_mouse_slot: u8,
        secondary_mouse_slot: u8,
        hotbar_ability_ids: [u16; 10],
    },
    AbilityUse { caster_nid: Nid, ability_id: u16 },
    CreatorState(AbilityCreatorState),
    MapTransfer {
        ws_url: String,
        join_ticket: String,
        map_config: MapConfig,
    },
    ServerPopulation { player_count: u16 },
    Disconnected { reason: String },
}

/// Minimal map description handed to a connecting client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapConfig {
    pub instance_id: String,
    pub seed: u64,
}
