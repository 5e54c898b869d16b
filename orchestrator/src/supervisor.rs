//! Map subprocess supervision.
//!
//! One child process per map instance, each with its own port and the
//! shared internal RPC secret. A crashed child restarts with a new pid
//! while the others stay up; tickets survive restarts because they live
//! in the orchestrator's database, not in the map.

use log::{error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};

/// Static description of one supervised map instance.
#[derive(Debug, Clone)]
pub struct MapSpec {
    pub instance_id: String,
    pub port: u16,
    pub seed: u64,
}

/// Live status surfaced on `/health`.
#[derive(Debug, Clone)]
pub struct MapStatus {
    pub instance_id: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub ready: bool,
}

/// Pause before restarting a crashed child.
const RESTART_BACKOFF: Duration = Duration::from_millis(250);

/// How long a freshly spawned map gets to open its listener.
const READY_PROBE_WINDOW: Duration = Duration::from_secs(5);

pub struct Supervisor {
    specs: Vec<MapSpec>,
    statuses: Arc<RwLock<HashMap<String, MapStatus>>>,
    kill_channels: Arc<RwLock<HashMap<String, mpsc::Sender<()>>>>,
    secret: String,
    orch_port: u16,
    server_bin: PathBuf,
}

/// Default map-server binary: a sibling of the orchestrator executable,
/// overridable with `MAP_SERVER_BIN`.
fn default_server_bin() -> PathBuf {
    if let Ok(explicit) = std::env::var("MAP_SERVER_BIN") {
        return PathBuf::from(explicit);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("server")))
        .unwrap_or_else(|| PathBuf::from("server"))
}

impl Supervisor {
    pub fn new(specs: Vec<MapSpec>, secret: String, orch_port: u16) -> Self {
        let statuses = specs
            .iter()
            .map(|s| {
                (
                    s.instance_id.clone(),
                    MapStatus {
                        instance_id: s.instance_id.clone(),
                        port: s.port,
                        pid: None,
                        ready: false,
                    },
                )
            })
            .collect();
        Self {
            specs,
            statuses: Arc::new(RwLock::new(statuses)),
            kill_channels: Arc::new(RwLock::new(HashMap::new())),
            secret,
            orch_port,
            server_bin: default_server_bin(),
        }
    }

    pub fn specs(&self) -> &[MapSpec] {
        &self.specs
    }

    pub fn spec(&self, instance_id: &str) -> Option<&MapSpec> {
        self.specs.iter().find(|s| s.instance_id == instance_id)
    }

    /// Public WebSocket URL for a map instance.
    pub fn ws_url_for(&self, instance_id: &str) -> Option<String> {
        self.spec(instance_id)
            .map(|s| format!("ws://127.0.0.1:{}", s.port))
    }

    pub async fn statuses(&self) -> Vec<MapStatus> {
        let map = self.statuses.read().await;
        let mut list: Vec<MapStatus> = map.values().cloned().collect();
        list.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        list
    }

    /// Starts one monitor task per map instance.
    pub async fn start(&self) {
        for spec in &self.specs {
            let (kill_tx, kill_rx) = mpsc::channel(1);
            self.kill_channels
                .write()
                .await
                .insert(spec.instance_id.clone(), kill_tx);

            tokio::spawn(monitor_map(
                spec.clone(),
                Arc::clone(&self.statuses),
                kill_rx,
                self.secret.clone(),
                self.orch_port,
                self.server_bin.clone(),
            ));
        }
    }

    /// Debug hook: kills a child; its monitor restarts it with a new pid.
    pub async fn crash(&self, instance_id: &str) -> bool {
        let channels = self.kill_channels.read().await;
        match channels.get(instance_id) {
            Some(tx) => tx.try_send(()).is_ok(),
            None => false,
        }
    }
}

fn spawn_map(
    spec: &MapSpec,
    secret: &str,
    orch_port: u16,
    server_bin: &PathBuf,
) -> std::io::Result<tokio::process::Child> {
    Command::new(server_bin)
        .env("MAP_INSTANCE_ID", &spec.instance_id)
        .env("MAP_PORT", spec.port.to_string())
        .env("MAP_SEED", spec.seed.to_string())
        .env("ORCH_URL", format!("http://127.0.0.1:{orch_port}"))
        .env("ORCH_INTERNAL_RPC_SECRET", secret)
        .kill_on_drop(true)
        .spawn()
}

async fn probe_ready(port: u16) -> bool {
    let deadline = tokio::time::Instant::now() + READY_PROBE_WINDOW;
    while tokio::time::Instant::now() < deadline {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Spawn → mark ready → wait for exit (or kill request) → restart.
async fn monitor_map(
    spec: MapSpec,
    statuses: Arc<RwLock<HashMap<String, MapStatus>>>,
    mut kill_rx: mpsc::Receiver<()>,
    secret: String,
    orch_port: u16,
    server_bin: PathBuf,
) {
    loop {
        let mut child = match spawn_map(&spec, &secret, orch_port, &server_bin) {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn map {}: {e}", spec.instance_id);
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };
        let pid = child.id();
        info!("Map {} started (pid {:?})", spec.instance_id, pid);
        if let Some(status) = statuses.write().await.get_mut(&spec.instance_id) {
            status.pid = pid;
            status.ready = false;
        }

        let ready = probe_ready(spec.port).await;
        if let Some(status) = statuses.write().await.get_mut(&spec.instance_id) {
            status.ready = ready;
        }
        if !ready {
            warn!("Map {} never became ready", spec.instance_id);
        }

        tokio::select! {
            exit = child.wait() => {
                match exit {
                    Ok(status) => warn!("Map {} exited: {status}", spec.instance_id),
                    Err(e) => error!("Map {} wait failed: {e}", spec.instance_id),
                }
            }
            _ = kill_rx.recv() => {
                warn!("Crash requested for map {}", spec.instance_id);
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        if let Some(status) = statuses.write().await.get_mut(&spec.instance_id) {
            status.ready = false;
            status.pid = None;
        }
        tokio::time::sleep(RESTART_BACKOFF).await;
    }
}
