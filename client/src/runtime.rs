//! Client runtime: owns the predicted simulation, the snapshot store
//! and the transport, and exposes the consumer hooks the renderer and
//! test harness drive (`advance_time`, `render_game_state`,
//! `set_test_movement`, `trigger_test_primary_action`,
//! `request_map_transfer`).

use crate::game::{ClientSim, PendingInput};
use crate::input::InputSampler;
use crate::network::{bootstrap, Connection, NetSim, NetSimConfig};
use crate::snapshot_store::{SnapshotStore, INTERPOLATION_DELAY};
use log::{debug, info, warn};
use shared::abilities::AbilityDefinition;
use shared::map::MapLayout;
use shared::protocol::{AbilityCreatorState, MapConfig, Message, ModelId};
use shared::{MoveInput, Nid, FIXED_DT};
use std::collections::HashMap;
use std::time::Instant;

/// Presentation-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Never connected or refused.
    Disconnected,
    Connected,
    /// Transport lost; simulation continues locally.
    LocalOnly,
}

/// Identity assigned by the map on join.
#[derive(Debug, Clone)]
pub struct Identity {
    pub nid: Nid,
    pub account_id: String,
    pub map_instance_id: String,
}

/// Local player pose handed to the renderer.
#[derive(Debug, Clone, Copy)]
pub struct LocalPose {
    pub position: [f32; 3],
    pub yaw: f32,
    pub pitch: f32,
    pub grounded: bool,
    pub health: i32,
    pub max_health: i32,
}

/// Remote entity view at render time.
#[derive(Debug, Clone)]
pub struct RemoteView {
    pub nid: Nid,
    pub model_id: ModelId,
    pub position: [f32; 3],
    pub yaw: f32,
    pub health: i32,
    pub max_health: i32,
}

/// Structured frame snapshot for the external renderer / test harness.
#[derive(Debug, Clone)]
pub struct RenderState {
    pub mode: ConnectionMode,
    pub nid: Option<Nid>,
    pub map_instance_id: Option<String>,
    pub local: Option<LocalPose>,
    pub remotes: Vec<RemoteView>,
    pub population: Option<u16>,
    pub last_refusal: Option<String>,
}

/// A pending map transfer the runtime should complete by reconnecting.
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    pub ws_url: String,
    pub join_ticket: String,
    pub map_config: MapConfig,
}

pub struct ClientRuntime {
    sim: ClientSim,
    store: SnapshotStore,
    sampler: InputSampler,
    connection: Option<Connection>,
    netsim: Option<NetSim>,
    mode: ConnectionMode,
    identity: Option<Identity>,
    map_config: Option<MapConfig>,
    abilities: HashMap<u16, AbilityDefinition>,
    loadout: Option<(u8, u8, [u16; 10])>,
    creator_state: Option<AbilityCreatorState>,
    population: Option<u16>,
    pending_transfer: Option<PendingTransfer>,
    last_refusal: Option<String>,
    accumulator_ms: f64,
    clock: f64,
}

impl ClientRuntime {
    /// Runtime with a local copy of the map built from its seed, not yet
    /// attached to a transport.
    pub fn offline(seed: u64) -> Self {
        let layout = MapLayout::generate(seed);
        Self {
            sim: ClientSim::new(layout.world.clone(), layout.platforms.clone(), 0),
            store: SnapshotStore::default(),
            sampler: InputSampler::new(),
            connection: None,
            netsim: None,
            mode: ConnectionMode::Disconnected,
            identity: None,
            map_config: None,
            abilities: HashMap::new(),
            loadout: None,
            creator_state: None,
            population: None,
            pending_transfer: None,
            last_refusal: None,
            accumulator_ms: 0.0,
            clock: 0.0,
        }
    }

    /// Bootstraps through the orchestrator and connects to the assigned
    /// map with the issued single-use ticket.
    pub async fn connect_bootstrap(
        orch_url: &str,
        auth_key: &str,
        netsim: NetSimConfig,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let grant = bootstrap(orch_url, auth_key).await?;
        let (ws_url, ticket, map_config) = match (grant.ws_url, grant.join_ticket, grant.map_config)
        {
            (Some(w), Some(t), Some(m)) => (w, t, m),
            _ => return Err("incomplete bootstrap response".into()),
        };
        Self::connect_with_ticket(&ws_url, &ticket, map_config, netsim).await
    }

    /// Connects with a ticket already in hand (initial join or transfer).
    pub async fn connect_with_ticket(
        ws_url: &str,
        join_ticket: &str,
        map_config: MapConfig,
        netsim: NetSimConfig,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let connection = Connection::connect(
            ws_url,
            Message::Join {
                auth_version: 1,
                auth_key: None,
                join_ticket: Some(join_ticket.to_string()),
            },
        )
        .await?;
        Ok(Self::attached(connection, map_config, netsim))
    }

    /// Connects directly to a standalone map with an auth key.
    pub async fn connect_direct(
        ws_url: &str,
        auth_key: &str,
        map_config: MapConfig,
        netsim: NetSimConfig,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let connection = Connection::connect(
            ws_url,
            Message::Join {
                auth_version: 1,
                auth_key: Some(auth_key.to_string()),
                join_ticket: None,
            },
        )
        .await?;
        Ok(Self::attached(connection, map_config, netsim))
    }

    fn attached(connection: Connection, map_config: MapConfig, netsim: NetSimConfig) -> Self {
        let mut runtime = Self::offline(map_config.seed);
        runtime.connection = Some(connection);
        runtime.mode = ConnectionMode::Connected;
        runtime.netsim = netsim
            .is_active()
            .then(|| NetSim::new(netsim, map_config.seed));
        runtime.map_config = Some(map_config);
        runtime
    }

    // === Consumer hooks ===

    /// Sets the scripted movement state used for every following step.
    pub fn set_test_movement(&mut self, movement: MoveInput) {
        self.sampler.set_movement(movement);
    }

    /// Enqueues exactly one primary pressed-edge.
    pub fn trigger_test_primary_action(&mut self) {
        self.sampler.trigger_primary();
    }

    pub fn set_look(&mut self, yaw_delta: f32, pitch_delta: f32) {
        self.sampler.add_look(yaw_delta, pitch_delta);
    }

    /// Asks the current map for a transfer; the resulting
    /// `MapTransferMessage` surfaces as [`ClientRuntime::take_pending_transfer`].
    pub fn request_map_transfer(&mut self, target_map_instance_id: &str) {
        if let Some(connection) = &self.connection {
            connection.send(Message::RequestMapTransfer {
                target_map_instance_id: target_map_instance_id.to_string(),
            });
        }
    }

    /// Advances the simulation by wall-clock milliseconds, running as
    /// many fixed steps as fit.
    pub fn advance_time(&mut self, ms: f64) {
        self.accumulator_ms += ms;
        let step_ms = FIXED_DT as f64 * 1000.0;
        while self.accumulator_ms >= step_ms {
            self.accumulator_ms -= step_ms;
            self.fixed_step();
        }
    }

    /// Structured snapshot of everything the renderer needs this frame.
    pub fn render_game_state(&self) -> RenderState {
        let own_nid = self.identity.as_ref().map(|i| i.nid);

        let local = own_nid.map(|nid| {
            let render_pos = self.sim.render_position();
            let (health, max_health) = self
                .store
                .get(nid)
                .map(|e| (e.slice.health, e.slice.max_health))
                .unwrap_or((shared::PLAYER_MAX_HEALTH, shared::PLAYER_MAX_HEALTH));
            LocalPose {
                position: [render_pos.x, render_pos.y, render_pos.z],
                yaw: self.sim.state.yaw,
                pitch: self.sim.state.pitch,
                grounded: self.sim.state.grounded,
                health,
                max_health,
            }
        });

        let render_time = self.clock - INTERPOLATION_DELAY;
        let mut remotes = Vec::new();
        for (nid, entity) in self.store.iter() {
            if Some(*nid) == own_nid {
                continue;
            }
            let (pos, yaw) = entity.sample(render_time);
            remotes.push(RemoteView {
                nid: *nid,
                model_id: entity.slice.model_id,
                position: [pos.x, pos.y, pos.z],
                yaw,
                health: entity.slice.health,
                max_health: entity.slice.max_health,
            });
        }
        remotes.sort_by_key(|r| r.nid);

        RenderState {
            mode: self.mode,
            nid: own_nid,
            map_instance_id: self.identity.as_ref().map(|i| i.map_instance_id.clone()),
            local,
            remotes,
            population: self.population,
            last_refusal: self.last_refusal.clone(),
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn abilities(&self) -> &HashMap<u16, AbilityDefinition> {
        &self.abilities
    }

    pub fn loadout(&self) -> Option<(u8, u8, [u16; 10])> {
        self.loadout
    }

    pub fn creator_state(&self) -> Option<&AbilityCreatorState> {
        self.creator_state.as_ref()
    }

    /// Takes the pending transfer, if the map handed one out.
    pub fn take_pending_transfer(&mut self) -> Option<PendingTransfer> {
        self.pending_transfer.take()
    }

    pub fn send(&self, message: Message) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.send(message))
            .unwrap_or(false)
    }

    // === Internals ===

    fn fixed_step(&mut self) {
        // Inbound first so this step predicts on top of fresh state.
        if let Some(mut connection) = self.connection.take() {
            if connection.is_closed() {
                warn!("Transport lost; entering local-only mode");
                self.mode = ConnectionMode::LocalOnly;
                self.sim.reset_pending();
            } else {
                for message in connection.drain() {
                    self.ingest_message(message);
                }
                self.connection = Some(connection);
            }
        }

        if let Some(netsim) = &mut self.netsim {
            for ack in netsim.release(Instant::now()) {
                self.sim.apply_ack(&ack);
            }
        }

        // Sample, send, predict.
        let command = self.sampler.next_command();
        if self.mode == ConnectionMode::Connected {
            if let Some(connection) = &self.connection {
                connection.send(Message::Input(command));
            }
        }
        self.sim.predict(PendingInput {
            sequence: command.sequence,
            input: MoveInput {
                forward: command.forward,
                strafe: command.strafe,
                jump: command.jump,
                sprint: command.sprint,
            },
            yaw: command.yaw,
            pitch: command.pitch,
        });
        // Carry rotates the view too; reflect it back into the sampler.
        self.sampler.carry_yaw(self.sim.state.yaw);

        self.sim.decay_smoothing(FIXED_DT);
        self.clock += FIXED_DT as f64;
    }

    /// Applies one server frame to the runtime. Public so embedding
    /// harnesses can drive the runtime without a live socket.
    pub fn ingest_message(&mut self, message: Message) {
        if self.store.apply(&message, self.clock) {
            return;
        }
        match message {
            Message::Identity {
                nid,
                account_id,
                map_instance_id,
                server_tick,
            } => {
                info!("Joined {map_instance_id} as nid {nid}");
                self.identity = Some(Identity {
                    nid,
                    account_id,
                    map_instance_id,
                });
                let layout = MapLayout::generate(
                    self.map_config.as_ref().map(|m| m.seed).unwrap_or(0),
                );
                self.sim = ClientSim::new(layout.world, layout.platforms, server_tick);
                self.store.clear();
                self.mode = ConnectionMode::Connected;
            }
            Message::JoinRefused { reason } => {
                warn!("Join refused: {}", reason.as_code());
                self.last_refusal = Some(reason.as_code().to_string());
                self.mode = ConnectionMode::Disconnected;
            }
            Message::Ack(ack) => match &mut self.netsim {
                Some(netsim) => netsim.offer(ack, Instant::now()),
                None => {
                    self.sim.apply_ack(&ack);
                }
            },
            Message::AbilityDefinition(def) => {
                self.abilities.insert(def.id, def);
            }
            Message::AbilityOwnership { ability_ids_csv } => {
                debug!("Unlocked abilities: {ability_ids_csv}");
            }
            Message::AbilityState {
                primary_mouse_slot,
                secondary_mouse_slot,
                hotbar_ability_ids,
            } => {
                self.loadout = Some((primary_mouse_slot, secondary_mouse_slot, hotbar_ability_ids));
            }
            Message::AbilityUse {
                caster_nid,
                ability_id,
            } => {
                debug!("Ability {ability_id} used by {caster_nid}");
            }
            Message::CreatorState(state) => {
                self.creator_state = Some(state);
            }
            Message::MapTransfer {
                ws_url,
                join_ticket,
                map_config,
            } => {
                info!("Transfer granted to {}", map_config.instance_id);
                self.pending_transfer = Some(PendingTransfer {
                    ws_url,
                    join_ticket,
                    map_config,
                });
            }
            Message::ServerPopulation { player_count } => {
                self.population = Some(player_count);
            }
            Message::Disconnected { reason } => {
                warn!("Server closed the session: {reason}");
                self.mode = ConnectionMode::LocalOnly;
                self.sim.reset_pending();
            }
            other => {
                debug!("Ignoring unexpected frame {other:?}");
            }
        }
    }

    /// Test access to the predicted simulation.
    pub fn sim(&self) -> &ClientSim {
        &self.sim
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::{EntityProp, EntitySlice, InputAck, JoinRefusal};
    use shared::MovementMode;

    fn identity_message() -> Message {
        Message::Identity {
            nid: 3,
            account_id: "acc".into(),
            map_instance_id: "map-a".into(),
            server_tick: 0,
        }
    }

    fn runtime() -> ClientRuntime {
        let mut rt = ClientRuntime::offline(1);
        rt.map_config = Some(MapConfig {
            instance_id: "map-a".into(),
            seed: 1,
        });
        rt.ingest_message(identity_message());
        rt
    }

    fn remote_slice(nid: Nid, x: f32) -> EntitySlice {
        EntitySlice {
            nid,
            model_id: ModelId::Player,
            x,
            y: 1.0,
            z: 0.0,
            yaw: 0.0,
            grounded: true,
            health: 100,
            max_health: 100,
            pid: None,
            owner_nid: None,
            radius: None,
        }
    }

    #[test]
    fn test_identity_establishes_session() {
        let rt = runtime();
        let state = rt.render_game_state();
        assert_eq!(state.nid, Some(3));
        assert_eq!(state.map_instance_id.as_deref(), Some("map-a"));
    }

    #[test]
    fn test_advance_time_runs_fixed_steps() {
        let mut rt = runtime();
        rt.set_test_movement(MoveInput {
            forward: 1.0,
            ..Default::default()
        });
        // 510 ms covers 30 fixed steps of prediction.
        rt.advance_time(510.0);
        assert_eq!(rt.sim().pending_len(), 30);
        let state = rt.render_game_state();
        assert!(state.local.unwrap().position[2] > 0.1);
    }

    #[test]
    fn test_accumulator_carries_fraction() {
        let mut rt = runtime();
        rt.advance_time(10.0); // less than one step (16.67 ms)
        assert_eq!(rt.sim().pending_len(), 0);
        rt.advance_time(10.0);
        assert_eq!(rt.sim().pending_len(), 1);
    }

    #[test]
    fn test_remote_entity_appears_in_render_state() {
        let mut rt = runtime();
        rt.ingest_message(Message::CreateEntity(remote_slice(9, 5.0)));
        let state = rt.render_game_state();
        assert_eq!(state.remotes.len(), 1);
        assert_eq!(state.remotes[0].nid, 9);
    }

    #[test]
    fn test_own_entity_excluded_from_remotes() {
        let mut rt = runtime();
        rt.ingest_message(Message::CreateEntity(remote_slice(3, 5.0)));
        let state = rt.render_game_state();
        assert!(state.remotes.is_empty());
        // But its health feeds the local pose.
        rt.ingest_message(Message::UpdateEntity {
            nid: 3,
            props: vec![EntityProp::Health(40)],
        });
        assert_eq!(rt.render_game_state().local.unwrap().health, 40);
    }

    #[test]
    fn test_ack_reconciles_predicted_state() {
        let mut rt = runtime();
        rt.set_test_movement(MoveInput {
            forward: 1.0,
            ..Default::default()
        });
        rt.advance_time(101.0); // 6 steps
        let acked = InputAck {
            sequence: 3,
            server_tick: 3,
            x: 0.0,
            y: 1.0,
            z: 0.3,
            vx: 0.0,
            vy: 0.0,
            vz: 2.0,
            grounded: true,
            grounded_platform_pid: None,
            movement_mode: MovementMode::Grounded,
        };
        rt.ingest_message(Message::Ack(acked));
        assert_eq!(rt.sim().pending_len(), 3);
        assert_eq!(rt.sim().last_ack_sequence(), Some(3));
    }

    #[test]
    fn test_refusal_surfaces_in_render_state() {
        let mut rt = runtime();
        rt.ingest_message(Message::JoinRefused {
            reason: JoinRefusal::TicketAlreadyConsumed,
        });
        let state = rt.render_game_state();
        assert_eq!(state.mode, ConnectionMode::Disconnected);
        assert_eq!(state.last_refusal.as_deref(), Some("ticket_already_consumed"));
    }

    #[test]
    fn test_map_transfer_pends() {
        let mut rt = runtime();
        rt.ingest_message(Message::MapTransfer {
            ws_url: "ws://127.0.0.1:9002".into(),
            join_ticket: "t2".into(),
            map_config: MapConfig {
                instance_id: "map-b".into(),
                seed: 2,
            },
        });
        let transfer = rt.take_pending_transfer().expect("transfer pending");
        assert_eq!(transfer.map_config.instance_id, "map-b");
        assert!(rt.take_pending_transfer().is_none());
    }

    #[test]
    fn test_population_and_loadout_tracked() {
        let mut rt = runtime();
        rt.ingest_message(Message::ServerPopulation { player_count: 4 });
        rt.ingest_message(Message::AbilityState {
            primary_mouse_slot: 0,
            secondary_mouse_slot: 1,
            hotbar_ability_ids: [1, 2, 0, 0, 0, 0, 0, 0, 0, 0],
        });
        assert_eq!(rt.render_game_state().population, Some(4));
        assert_eq!(rt.loadout().unwrap().2[0], 1);
    }

    #[test]
    fn test_trigger_primary_marks_next_command() {
        let mut rt = runtime();
        rt.trigger_test_primary_action();
        rt.advance_time(17.0); // one step consumes the edge
        // The edge is consumed by the step; a second step has none.
        assert_eq!(rt.sim().pending_len(), 1);
    }
}
