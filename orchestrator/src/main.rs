//! Orchestrator process entry point.
//!
//! Environment variables are the primary configuration surface and part
//! of the ops contract: `ORCH_PORT`, `ORCH_DATA_PATH`,
//! `ORCH_JOIN_TICKET_TTL_MS`, `ORCH_INTERNAL_RPC_SECRET`, and
//! `MAP_<ID>_PORT` per supervised map. Exits 0 on clean shutdown and
//! nonzero on fatal init.

use clap::Parser;
use log::{error, info};
use orchestrator::http::{router, AppState};
use orchestrator::store::Store;
use orchestrator::supervisor::{MapSpec, Supervisor};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Shardworld orchestrator")]
struct Args {
    /// HTTP port (env ORCH_PORT)
    #[clap(long, default_value = "8080")]
    port: u16,

    /// SQLite database path (env ORCH_DATA_PATH)
    #[clap(long, default_value = "orchestrator.db")]
    data_path: String,

    /// Join ticket TTL in milliseconds (env ORCH_JOIN_TICKET_TTL_MS)
    #[clap(long, default_value = "30000")]
    ticket_ttl_ms: i64,

    /// Enable debug endpoints (crash-map)
    #[clap(long)]
    debug_endpoints: bool,
}

fn env_override<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

/// Map instances this orchestrator hosts. Ports come from the
/// `MAP_<ID>_PORT` contract with deployment tooling.
fn map_specs() -> Vec<MapSpec> {
    vec![
        MapSpec {
            instance_id: "map-a".into(),
            port: env_override("MAP_A_PORT", 9001),
            seed: env_override("MAP_A_SEED", 1),
        },
        MapSpec {
            instance_id: "map-b".into(),
            port: env_override("MAP_B_PORT", 9002),
            seed: env_override("MAP_B_SEED", 2),
        },
    ]
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let port: u16 = env_override("ORCH_PORT", args.port);
    let data_path = std::env::var("ORCH_DATA_PATH").unwrap_or(args.data_path);
    let ticket_ttl_ms: i64 = env_override("ORCH_JOIN_TICKET_TTL_MS", args.ticket_ttl_ms);
    let debug_endpoints = args.debug_endpoints
        || std::env::var("ORCH_DEBUG_ENDPOINTS").is_ok_and(|v| v == "1" || v == "true");
    let secret = std::env::var("ORCH_INTERNAL_RPC_SECRET").unwrap_or_else(|_| {
        let generated = format!("orch-{}", uuid::Uuid::new_v4());
        info!("Generated internal RPC secret");
        generated
    });

    let store = match Store::open(&data_path).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open data store at {data_path}: {e}");
            std::process::exit(2);
        }
    };

    let supervisor = Arc::new(Supervisor::new(map_specs(), secret.clone(), port));
    supervisor.start().await;

    let state = Arc::new(AppState {
        store,
        supervisor,
        secret,
        ticket_ttl_ms,
        debug_endpoints,
    });

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind port {port}: {e}");
            std::process::exit(2);
        }
    };
    info!("Orchestrator listening on port {port} (ticket ttl {ticket_ttl_ms} ms)");

    if let Err(e) = axum::serve(listener, router(state)).await {
        error!("HTTP server failed: {e}");
        std::process::exit(1);
    }
}
