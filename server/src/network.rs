//! Map-instance network layer: WebSocket transport, handshake, and the
//! fixed-rate authoritative tick loop.
//!
//! ## Architecture
//!
//! - **Accept task**: upgrades connections, runs the join handshake
//!   (ticket validation against the orchestrator), registers the client
//!   and forwards its frames to the main loop.
//! - **Writer tasks**: one per connection; drain the client's bounded
//!   outbound channel into the socket so slow links never stall the
//!   tick.
//! - **Timeout task**: reaps idle connections.
//! - **Main loop**: owns the authoritative `GameState`; `tokio::select!`
//!   between network events and the 60 Hz tick interval. Nothing else
//!   ever mutates the simulation.

use crate::abilities::{default_abilities, default_ability_ids, CreatorOutcome, CreatorSession};
use crate::client_manager::{ClientManager, SEND_CHANNEL_CAPACITY};
use crate::combat::{self, TargetRef};
use crate::game::GameState;
use crate::handshake::OrchClient;
use shared::map::MapLayout;
use crate::replication;
use bincode::{deserialize, serialize};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use shared::abilities::AbilityDefinition;
use shared::protocol::{JoinRefusal, Message};
use shared::{Nid, PlayerSnapshot, FIXED_DT, TICK_RATE};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, WebSocketStream};

/// Handshake must complete within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Map instance configuration resolved from flags and environment.
#[derive(Clone)]
pub struct ServerConfig {
    pub instance_id: String,
    pub bind_addr: String,
    pub seed: u64,
    pub max_clients: usize,
    pub idle_timeout: Duration,
    pub tick_log: bool,
    /// `None` runs the map standalone with direct auth-key joins.
    pub orch: Option<OrchClient>,
}

/// Events flowing from network tasks into the main loop.
pub enum ServerEvent {
    /// Handshake finished and the client is registered under `nid`.
    Joined {
        nid: Nid,
        snapshot: Option<PlayerSnapshot>,
    },
    /// A frame arrived from a registered connection.
    Frame { nid: Nid, message: Message },
    /// Connection closed or timed out.
    Closed { nid: Nid },
}

pub struct Server {
    config: ServerConfig,
    game: GameState,
    clients: Arc<Mutex<ClientManager>>,
    abilities: HashMap<u16, AbilityDefinition>,
    creator_sessions: HashMap<Nid, CreatorSession>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let layout = MapLayout::generate(config.seed);
        info!(
            "Map {} layout seed {} hash {}",
            config.instance_id,
            config.seed,
            &layout.layout_hash()[..16]
        );

        Self {
            game: GameState::new(layout),
            clients: Arc::new(Mutex::new(ClientManager::new(config.max_clients))),
            abilities: default_abilities().into_iter().map(|d| (d.id, d)).collect(),
            creator_sessions: HashMap::new(),
            event_tx,
            event_rx,
            config,
        }
    }

    /// Binds the listener and runs the accept, timeout and tick loops
    /// until the process is stopped.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!(
            "Map {} listening on {}",
            self.config.instance_id, self.config.bind_addr
        );

        self.spawn_accept_loop(listener);
        self.spawn_timeout_checker();

        let mut tick_interval = interval(Duration::from_secs_f64(1.0 / TICK_RATE as f64));

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("Event channel closed; shutting down");
                            break;
                        }
                    }
                },
                _ = tick_interval.tick() => {
                    self.tick().await;
                },
            }
        }

        Ok(())
    }

    fn spawn_accept_loop(&self, listener: TcpListener) {
        let clients = Arc::clone(&self.clients);
        let event_tx = self.event_tx.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            while let Ok((stream, addr)) = listener.accept().await {
                debug!("Incoming connection from {addr}");
                let clients = Arc::clone(&clients);
                let event_tx = event_tx.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, clients, event_tx, config).await {
                        debug!("Connection from {addr} ended: {e}");
                    }
                });
            }
        });
    }

    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let event_tx = self.event_tx.clone();
        let idle = self.config.idle_timeout;

        tokio::spawn(async move {
            let mut check = interval(Duration::from_secs(1));
            loop {
                check.tick().await;
                let reaped = {
                    let mut clients = clients.lock().await;
                    clients.check_timeouts(idle)
                };
                for nid in reaped {
                    if event_tx.send(ServerEvent::Closed { nid }).is_err() {
                        return;
                    }
                }
            }
        });
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Joined { nid, snapshot } => {
                let account_id = {
                    let clients = self.clients.lock().await;
                    match clients.get(nid) {
                        Some(c) => c.account_id.clone(),
                        None => return,
                    }
                };
                self.game
                    .add_player(nid, account_id.clone(), snapshot, &default_ability_ids());

                let clients = self.clients.lock().await;
                if let (Some(client), Some(player)) = (clients.get(nid), self.game.players.get(&nid)) {
                    client.send(Message::Identity {
                        nid,
                        account_id,
                        map_instance_id: self.config.instance_id.clone(),
                        server_tick: self.game.tick,
                    });
                    for id in &player.unlocked_ability_ids {
                        if let Some(def) = self.abilities.get(id) {
                            client.send(Message::AbilityDefinition(def.clone()));
                        }
                    }
                    client.send(ownership_message(player));
                    client.send(ability_state_message(player));
                }
            }
            ServerEvent::Frame { nid, message } => self.handle_frame(nid, message).await,
            ServerEvent::Closed { nid } => {
                self.creator_sessions.remove(&nid);
                self.game.remove_player(nid);
                let mut clients = self.clients.lock().await;
                clients.remove_client(nid);
            }
        }
    }

    async fn handle_frame(&mut self, nid: Nid, message: Message) {
        match message {
            Message::Input(command) => {
                let mut clients = self.clients.lock().await;
                if let Some(client) = clients.get_mut(nid) {
                    client.push_command(command);
                }
            }
            Message::Loadout(command) => {
                self.handle_loadout(nid, command).await;
            }
            Message::Creator(command) => {
                let session = self.creator_sessions.entry(nid).or_default();
                match session.apply(command) {
                    CreatorOutcome::Submitted(mut def) => {
                        def.id = self.game.alloc_ability_id();
                        let id = def.id;
                        self.abilities.insert(id, def.clone());
                        if let Some(player) = self.game.players.get_mut(&nid) {
                            player.unlocked_ability_ids.insert(id);
                        }
                        let state = self.creator_sessions.get(&nid).map(|s| s.state());
                        let clients = self.clients.lock().await;
                        if let (Some(client), Some(player)) =
                            (clients.get(nid), self.game.players.get(&nid))
                        {
                            client.send(Message::AbilityDefinition(def));
                            client.send(ownership_message(player));
                            if let Some(state) = state {
                                client.send(Message::CreatorState(state));
                            }
                        }
                        info!("Player {} created ability {}", nid, id);
                    }
                    CreatorOutcome::StateChanged => {
                        let state = self.creator_sessions.get(&nid).map(|s| s.state());
                        let clients = self.clients.lock().await;
                        if let (Some(client), Some(state)) = (clients.get(nid), state) {
                            client.send(Message::CreatorState(state));
                        }
                    }
                }
            }
            Message::RequestMapTransfer { target_map_instance_id } => {
                self.handle_transfer_request(nid, target_map_instance_id).await;
            }
            Message::Disconnect => {
                let _ = self.event_tx.send(ServerEvent::Closed { nid });
            }
            other => {
                debug!("Client {nid} sent unexpected frame {other:?}");
            }
        }
    }

    async fn handle_loadout(&mut self, nid: Nid, command: shared::protocol::LoadoutCommand) {
        use shared::protocol::LoadoutCommand;

        let Some(player) = self.game.players.get_mut(&nid) else {
            return;
        };
        let valid = match command {
            LoadoutCommand::SetHotbarSlot { slot, ability_id } => {
                if slot < 10 && player.unlocked_ability_ids.contains(&ability_id) {
                    player.hotbar_ability_ids[slot as usize] = ability_id;
                    true
                } else {
                    false
                }
            }
            LoadoutCommand::SetPrimarySlot { slot } => {
                if slot < 10 {
                    player.primary_mouse_slot = slot;
                    true
                } else {
                    false
                }
            }
            LoadoutCommand::SetSecondarySlot { slot } => {
                if slot < 10 {
                    player.secondary_mouse_slot = slot;
                    true
                } else {
                    false
                }
            }
        };

        if valid {
            let message = ability_state_message(player);
            let clients = self.clients.lock().await;
            if let Some(client) = clients.get(nid) {
                client.send(message);
            }
        } else {
            debug!("Client {nid} sent invalid loadout command");
        }
    }

    async fn handle_transfer_request(&mut self, nid: Nid, target: String) {
        let Some(orch) = self.config.orch.clone() else {
            warn!("Transfer requested by {nid} but no orchestrator configured");
            return;
        };
        let Some(player) = self.game.players.get(&nid) else {
            return;
        };
        let snapshot = player.snapshot();
        let account_id = player.account_id.clone();
        let from_map = self.config.instance_id.clone();

        // Pull the player out of the simulation now: the ack stream
        // pauses and the client reconnects with the fresh ticket.
        self.game.remove_player(nid);

        let sender = {
            let clients = self.clients.lock().await;
            clients.get(nid).map(|c| c.sender_clone())
        };
        let Some(sender) = sender else { return };

        tokio::spawn(async move {
            match orch.request_transfer(&account_id, &from_map, &target, &snapshot).await {
                Ok(grant) => {
                    let _ = sender
                        .send(Message::MapTransfer {
                            ws_url: grant.ws_url,
                            join_ticket: grant.join_ticket,
                            map_config: grant.map_config,
                        })
                        .await;
                }
                Err(e) => {
                    warn!("Transfer for {account_id} failed: {e}");
                    let _ = sender
                        .send(Message::Disconnected {
                            reason: "transfer failed".into(),
                        })
                        .await;
                }
            }
        });
    }

    /// One authoritative tick.
    async fn tick(&mut self) {
        // Lock through a local handle so the guard's borrow does not
        // pin `self` while the simulation below needs it mutably.
        let clients_handle = Arc::clone(&self.clients);
        let mut clients = clients_handle.lock().await;

        // 1. Drain at most one command per player, oldest first.
        let mut commands = Vec::new();
        for nid in clients.nids() {
            if let Some(client) = clients.get_mut(nid) {
                if let Some(command) = client.pop_command() {
                    client.last_processed_sequence = Some(command.sequence);
                    commands.push((nid, command));
                }
            }
        }

        // 2. Step players: commands first, then idle bodies.
        let mut fire_intents: Vec<Nid> = Vec::new();
        let commanded: Vec<Nid> = commands.iter().map(|(nid, _)| *nid).collect();
        for (nid, command) in &commands {
            self.game.apply_command(*nid, command);
            if command.primary_pressed {
                fire_intents.push(*nid);
            }
        }
        for nid in self.game.player_nids() {
            if !commanded.contains(&nid) {
                self.game.step_idle(nid);
            }
        }

        // 3./4. Combat: projectiles integrate, then this tick's triggers.
        combat::integrate_projectiles(&mut self.game, FIXED_DT);
        for nid in fire_intents {
            self.fire_primary(nid, &clients);
        }

        // 5. Owner-only acks for every active player.
        for nid in clients.nids() {
            if let (Some(client), Some(player)) = (clients.get(nid), self.game.players.get(&nid)) {
                if let Some(ack) = player.last_ack {
                    client.send(Message::Ack(ack));
                }
            }
        }

        // 6. Replication: move view boxes, emit diffs.
        let slices = replication::entity_slices(&self.game);
        for nid in clients.nids() {
            let center = self.game.players.get(&nid).map(|p| p.kin.position);
            if let Some(client) = clients.get_mut(nid) {
                if let Some(center) = center {
                    client.view.center = center;
                }
                if client.can_accept_diffs() {
                    let visible = replication::visible_for(&slices, &client.view, nid);
                    for message in replication::diff_for_user(&mut client.known_entities, &visible) {
                        client.send(message);
                    }
                }
            }
        }

        // 7. Periodic population report.
        if self.game.tick % TICK_RATE as u64 == 0 {
            let count = clients.len() as u16;
            for nid in clients.nids() {
                if let Some(client) = clients.get(nid) {
                    client.send(Message::ServerPopulation { player_count: count });
                }
            }
        }

        if self.config.tick_log && self.game.tick % TICK_RATE as u64 == 0 {
            debug!(
                "tick {}: {} players, {} projectiles",
                self.game.tick,
                self.game.players.len(),
                self.game.projectiles.len()
            );
        }

        // 8. Advance the tick number.
        self.game.tick += 1;
    }

    fn fire_primary(&mut self, nid: Nid, clients: &ClientManager) {
        let Some(player) = self.game.players.get(&nid) else {
            return;
        };
        let Some(ability_id) = player.primary_ability_id() else {
            return;
        };
        let Some(def) = self.abilities.get(&ability_id).cloned() else {
            debug!("Player {nid} fired unknown ability {ability_id}");
            return;
        };

        let now = self.game.time();
        let ready = player
            .cooldowns
            .get(&ability_id)
            .map_or(true, |ready_at| now >= *ready_at);
        if !ready {
            return;
        }

        let cooldown = def
            .projectile
            .map(|p| p.cooldown)
            .or(def.melee.map(|m| m.cooldown))
            .unwrap_or(0.5);

        let fired = if let Some(profile) = def.projectile {
            combat::spawn_projectile(&mut self.game, nid, &profile).is_some()
        } else if let Some(profile) = def.melee {
            match combat::perform_melee(&self.game, nid, &profile) {
                Some(TargetRef::Player(target)) => {
                    self.game.apply_damage_to_player(target, profile.damage);
                    true
                }
                Some(TargetRef::Dummy(target)) => {
                    self.game.apply_damage_to_dummy(target, profile.damage);
                    true
                }
                _ => true, // a whiffed swing still consumes the cooldown
            }
        } else {
            false
        };

        if fired {
            if let Some(player) = self.game.players.get_mut(&nid) {
                player.cooldowns.insert(ability_id, now + cooldown as f64);
            }
            // Broadcast to everyone whose view contains the caster.
            if let Some(caster) = self.game.players.get(&nid) {
                let [x, y, z] = caster.kin.position;
                for viewer_nid in clients.nids() {
                    if let Some(viewer) = clients.get(viewer_nid) {
                        if viewer_nid == nid || viewer.view.contains(x, y, z) {
                            viewer.send(Message::AbilityUse {
                                caster_nid: nid,
                                ability_id,
                            });
                        }
                    }
                }
            }
        }
    }
}

fn ownership_message(player: &crate::game::ServerPlayer) -> Message {
    let csv = player
        .unlocked_ability_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    Message::AbilityOwnership {
        ability_ids_csv: csv,
    }
}

fn ability_state_message(player: &crate::game::ServerPlayer) -> Message {
    Message::AbilityState {
        primary_mouse_slot: player.primary_mouse_slot,
        secondary_mouse_slot: player.secondary_mouse_slot,
        hotbar_ability_ids: player.hotbar_ability_ids,
    }
}

/// Derives a stable local account id from an auth key (standalone mode,
/// no orchestrator).
fn local_account_id(auth_key: &str) -> String {
    let digest = Sha256::digest(auth_key.as_bytes());
    format!("local-{:02x}{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2], digest[3])
}

async fn send_ws(ws: &mut WebSocketStream<TcpStream>, message: &Message) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bytes = serialize(message)?;
    ws.send(WsMessage::Binary(bytes)).await?;
    Ok(())
}

/// Full lifecycle of one client connection: handshake, registration,
/// writer task, read loop.
async fn handle_connection(
    stream: TcpStream,
    clients: Arc<Mutex<ClientManager>>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut ws = accept_async(stream).await?;

    // First frame must be the Join handshake.
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws.next())
        .await
        .map_err(|_| "handshake timeout")?
        .ok_or("closed before handshake")??;

    let join = match first {
        WsMessage::Binary(bytes) => deserialize::<Message>(&bytes).ok(),
        _ => None,
    };
    let Some(Message::Join {
        auth_version,
        auth_key,
        join_ticket,
    }) = join
    else {
        let _ = send_ws(
            &mut ws,
            &Message::JoinRefused {
                reason: JoinRefusal::BadHandshake,
            },
        )
        .await;
        return Err("bad handshake".into());
    };
    if auth_version != 1 {
        let _ = send_ws(
            &mut ws,
            &Message::JoinRefused {
                reason: JoinRefusal::BadHandshake,
            },
        )
        .await;
        return Err("unsupported auth version".into());
    }

    // Resolve identity: ticket through the orchestrator, or direct auth
    // key in standalone mode.
    let (account_id, snapshot) = match (&config.orch, join_ticket, auth_key) {
        (Some(orch), Some(ticket), _) => {
            match orch.validate_join_ticket(&ticket, &config.instance_id).await {
                Ok(validated) => (validated.account_id, validated.snapshot),
                Err(reason) => {
                    info!("Join refused: {}", reason.as_code());
                    let _ = send_ws(&mut ws, &Message::JoinRefused { reason }).await;
                    return Ok(());
                }
            }
        }
        (None, _, Some(key)) => (local_account_id(&key), None),
        _ => {
            let _ = send_ws(
                &mut ws,
                &Message::JoinRefused {
                    reason: JoinRefusal::BadHandshake,
                },
            )
            .await;
            return Err("no credentials".into());
        }
    };

    // Register and split into reader/writer halves.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(SEND_CHANNEL_CAPACITY);
    let nid = {
        let mut clients = clients.lock().await;
        clients.add_client(account_id.clone(), out_tx)
    };
    let Some(nid) = nid else {
        let _ = send_ws(
            &mut ws,
            &Message::Disconnected {
                reason: "server full".into(),
            },
        )
        .await;
        return Ok(());
    };

    let (mut sink, mut source) = ws.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let Ok(bytes) = serialize(&message) else {
                continue;
            };
            if sink.send(WsMessage::Binary(bytes)).await.is_err() {
                break;
            }
        }
    });

    if event_tx.send(ServerEvent::Joined { nid, snapshot }).is_err() {
        writer.abort();
        return Ok(());
    }

    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Binary(bytes)) => match deserialize::<Message>(&bytes) {
                Ok(message) => {
                    if event_tx.send(ServerEvent::Frame { nid, message }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Client {nid}: dropping malformed frame ({e})");
                }
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Client {nid}: socket error {e}");
                break;
            }
        }
    }

    let _ = event_tx.send(ServerEvent::Closed { nid });
    writer.abort();
    Ok(())
}
