//! Client connection management and per-player command queuing.

use log::{debug, info};
use shared::math::sequence_ahead;
use shared::protocol::{EntitySlice, InputCommand, Message};
use shared::Nid;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Commands buffered per connection; beyond this the oldest is dropped.
const MAX_QUEUED_COMMANDS: usize = 64;

/// Remaining send-channel permits below which entity diff emission is
/// coalesced into a later tick.
pub const SEND_COALESCE_THRESHOLD: usize = 64;

/// Capacity of a connection's outbound channel.
pub const SEND_CHANNEL_CAPACITY: usize = 1024;

/// Per-user 3D axis-aligned view volume for the replication channel.
#[derive(Debug, Clone, Copy)]
pub struct ViewBox {
    pub center: [f32; 3],
    pub half_width: f32,
    pub half_height: f32,
    pub half_depth: f32,
}

impl Default for ViewBox {
    fn default() -> Self {
        Self {
            center: [0.0; 3],
            half_width: 24.0,
            half_height: 16.0,
            half_depth: 24.0,
        }
    }
}

impl ViewBox {
    pub fn contains(&self, x: f32, y: f32, z: f32) -> bool {
        (x - self.center[0]).abs() <= self.half_width
            && (y - self.center[1]).abs() <= self.half_height
            && (z - self.center[2]).abs() <= self.half_depth
    }
}

/// Connected client with its input queue and replication bookkeeping.
pub struct Client {
    pub nid: Nid,
    pub account_id: String,
    pub last_seen: Instant,
    pub last_processed_sequence: Option<u16>,
    pub view: ViewBox,
    /// Last emitted slice per entity, the diffing baseline.
    pub known_entities: HashMap<Nid, EntitySlice>,
    queue: VecDeque<InputCommand>,
    sender: mpsc::Sender<Message>,
}

impl Client {
    pub fn new(nid: Nid, account_id: String, sender: mpsc::Sender<Message>) -> Self {
        Self {
            nid,
            account_id,
            last_seen: Instant::now(),
            last_processed_sequence: None,
            view: ViewBox::default(),
            known_entities: HashMap::new(),
            queue: VecDeque::new(),
            sender,
        }
    }

    /// Enqueues a command, rejecting stale or out-of-order sequences.
    /// A full queue drops its oldest entry so fresh input wins.
    pub fn push_command(&mut self, command: InputCommand) {
        self.last_seen = Instant::now();

        if let Some(last) = self.last_processed_sequence {
            if !sequence_ahead(command.sequence, last) {
                debug!(
                    "Client {}: stale command {} (last processed {})",
                    self.nid, command.sequence, last
                );
                return;
            }
        }
        if let Some(back) = self.queue.back() {
            if !sequence_ahead(command.sequence, back.sequence) {
                debug!(
                    "Client {}: out-of-order command {} (queued up to {})",
                    self.nid, command.sequence, back.sequence
                );
                return;
            }
        }

        if self.queue.len() >= MAX_QUEUED_COMMANDS {
            self.queue.pop_front();
        }
        self.queue.push_back(command);
    }

    /// Takes the oldest non-stale command; at most one per tick.
    pub fn pop_command(&mut self) -> Option<InputCommand> {
        while let Some(front) = self.queue.front() {
            let stale = self
                .last_processed_sequence
                .is_some_and(|last| !sequence_ahead(front.sequence, last));
            if stale {
                self.queue.pop_front();
            } else {
                return self.queue.pop_front();
            }
        }
        None
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Queues an outbound message; drops it if the connection is saturated.
    pub fn send(&self, message: Message) {
        if let Err(e) = self.sender.try_send(message) {
            debug!("Client {}: dropping outbound message ({e})", self.nid);
        }
    }

    /// True when the send channel has room for a full diff burst.
    pub fn can_accept_diffs(&self) -> bool {
        self.sender.capacity() > SEND_COALESCE_THRESHOLD
    }

    /// Handle for tasks that outlive the client-manager lock.
    pub fn sender_clone(&self) -> mpsc::Sender<Message> {
        self.sender.clone()
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all connected clients and nid assignment.
pub struct ClientManager {
    clients: HashMap<Nid, Client>,
    next_nid: Nid,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_nid: 1,
            max_clients,
        }
    }

    /// Registers a connection, returning its nid, or `None` if full.
    pub fn add_client(&mut self, account_id: String, sender: mpsc::Sender<Message>) -> Option<Nid> {
        if self.clients.len() >= self.max_clients {
            return None;
        }
        // Recycle nids, skipping ones still in use and the entity range.
        let mut nid = self.next_nid;
        loop {
            if nid == 0 || nid >= crate::game::PLATFORM_NID_BASE {
                nid = 1;
            }
            if !self.clients.contains_key(&nid) {
                break;
            }
            nid += 1;
        }
        self.next_nid = nid + 1;

        info!("Client {} connected ({})", nid, account_id);
        self.clients.insert(nid, Client::new(nid, account_id, sender));
        Some(nid)
    }

    pub fn remove_client(&mut self, nid: Nid) -> bool {
        if self.clients.remove(&nid).is_some() {
            info!("Client {} disconnected", nid);
            true
        } else {
            false
        }
    }

    pub fn get(&self, nid: Nid) -> Option<&Client> {
        self.clients.get(&nid)
    }

    pub fn get_mut(&mut self, nid: Nid) -> Option<&mut Client> {
        self.clients.get_mut(&nid)
    }

    /// Nids in deterministic order for tick processing.
    pub fn nids(&self) -> Vec<Nid> {
        let mut nids: Vec<Nid> = self.clients.keys().copied().collect();
        nids.sort_unstable();
        nids
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Removes and returns clients idle past `timeout`.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<Nid> {
        let timed_out: Vec<Nid> = self
            .clients
            .iter()
            .filter(|(_, c)| c.is_timed_out(timeout))
            .map(|(nid, _)| *nid)
            .collect();
        for nid in &timed_out {
            self.remove_client(*nid);
        }
        timed_out
    }
}
