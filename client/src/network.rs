//! Client transport: orchestrator bootstrap, WebSocket connection, and
//! optional ack-path network simulation for netcode testing.

use bincode::{deserialize, serialize};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use shared::protocol::{InputAck, MapConfig, Message};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Transport connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded in-flight buffer for delayed acks in the network simulator.
const NETSIM_INFLIGHT_CAP: usize = 64;

/// What `/bootstrap` hands back for a fresh session.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapResponse {
    pub ok: bool,
    #[serde(rename = "wsUrl")]
    pub ws_url: Option<String>,
    #[serde(rename = "joinTicket")]
    pub join_ticket: Option<String>,
    #[serde(rename = "mapConfig")]
    pub map_config: Option<MapConfig>,
}

/// Calls the orchestrator bootstrap endpoint with an auth key.
pub async fn bootstrap(
    orch_url: &str,
    auth_key: &str,
) -> Result<BootstrapResponse, Box<dyn std::error::Error + Send + Sync>> {
    let url = format!("{}/bootstrap", orch_url.trim_end_matches('/'));
    let response: BootstrapResponse = reqwest::Client::new()
        .post(&url)
        .timeout(Duration::from_secs(25))
        .json(&serde_json::json!({ "authKey": auth_key }))
        .send()
        .await?
        .json()
        .await?;
    if !response.ok {
        return Err("bootstrap refused".into());
    }
    Ok(response)
}

/// A live connection to a map instance. Frames are bincode `Message`s;
/// reader and writer run as background tasks bridged by channels.
pub struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    incoming: mpsc::UnboundedReceiver<Message>,
}

impl Connection {
    /// Connects, sends the join handshake, and spawns the socket tasks.
    pub async fn connect(
        ws_url: &str,
        join: Message,
    ) -> Result<Connection, Box<dyn std::error::Error + Send + Sync>> {
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(ws_url))
            .await
            .map_err(|_| "connect timeout")??;
        info!("Connected to {ws_url}");

        let (mut sink, mut source) = ws.split();
        sink.send(WsMessage::Binary(serialize(&join)?)).await?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let Ok(bytes) = serialize(&message) else {
                    continue;
                };
                if sink.send(WsMessage::Binary(bytes)).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(WsMessage::Binary(bytes)) => match deserialize::<Message>(&bytes) {
                        Ok(message) => {
                            if in_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("Dropping malformed frame: {e}"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Socket error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }

    /// Queues a frame for sending; returns `false` once the socket task
    /// is gone.
    pub fn send(&self, message: Message) -> bool {
        self.outgoing.send(message).is_ok()
    }

    /// Drains every frame received since the last call. `None` in the
    /// vector position is never produced; a closed socket yields
    /// `Err(Closed)` semantics via `is_closed`.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = self.incoming.try_recv() {
            messages.push(message);
        }
        messages
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }
}

/// Ack-path network condition simulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetSimConfig {
    /// Probability in `[0, 1]` of dropping an ack outright.
    pub ack_drop_rate: f64,
    /// Base artificial delay before an ack is applied.
    pub ack_delay_ms: u64,
    /// Uniform jitter added in `[-jitter, +jitter]`.
    pub ack_jitter_ms: u64,
}

impl NetSimConfig {
    pub fn is_active(&self) -> bool {
        self.ack_drop_rate > 0.0 || self.ack_delay_ms > 0 || self.ack_jitter_ms > 0
    }
}

/// Holds acks in flight and releases them after their simulated delay.
pub struct NetSim {
    config: NetSimConfig,
    inflight: VecDeque<(Instant, InputAck)>,
    rng: StdRng,
}

impl NetSim {
    pub fn new(config: NetSimConfig, seed: u64) -> Self {
        Self {
            config,
            inflight: VecDeque::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Offers an ack to the simulator; it may be dropped or delayed.
    pub fn offer(&mut self, ack: InputAck, now: Instant) {
        if self.config.ack_drop_rate > 0.0 && self.rng.gen_bool(self.config.ack_drop_rate.clamp(0.0, 1.0)) {
            return;
        }
        let jitter = if self.config.ack_jitter_ms > 0 {
            let j = self.config.ack_jitter_ms as i64;
            self.rng.gen_range(-j..=j)
        } else {
            0
        };
        let delay_ms = (self.config.ack_delay_ms as i64 + jitter).max(0) as u64;
        let release = now + Duration::from_millis(delay_ms);

        if self.inflight.len() >= NETSIM_INFLIGHT_CAP {
            self.inflight.pop_front();
        }
        self.inflight.push_back((release, ack));
    }

    /// Releases every ack whose delay has elapsed, in arrival order.
    pub fn release(&mut self, now: Instant) -> Vec<InputAck> {
        let mut released = Vec::new();
        // Arrival order is preserved; delays are per-ack but the ring is
        // drained front-first so reordering never exceeds the jitter.
        while self
            .inflight
            .front()
            .is_some_and(|(release_at, _)| *release_at <= now)
        {
            if let Some((_, ack)) = self.inflight.pop_front() {
                released.push(ack);
            }
        }
        released
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }
}
