//! Map-instance process entry point.
//!
//! Configuration comes from CLI flags with environment overrides; the
//! env var names are part of the ops contract with the orchestrator.

use clap::Parser;
use log::info;
use server::handshake::OrchClient;
use server::network::{Server, ServerConfig};
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Shardworld map instance server")]
struct Args {
    /// Map instance identifier (env MAP_INSTANCE_ID)
    #[clap(long, default_value = "map-a")]
    instance_id: String,

    /// Address to bind the WebSocket listener to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (env MAP_PORT)
    #[clap(short, long, default_value = "9001")]
    port: u16,

    /// Layout seed (env MAP_SEED)
    #[clap(long, default_value = "1")]
    seed: u64,

    /// Orchestrator base URL for ticket RPCs (env ORCH_URL); omit to run
    /// standalone with direct auth-key joins
    #[clap(long)]
    orch_url: Option<String>,

    /// Maximum concurrent players
    #[clap(long, default_value = "32")]
    max_clients: usize,

    /// Seconds of silence before a client is reaped
    #[clap(long, default_value = "15")]
    idle_timeout_secs: u64,
}

fn env_override<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let instance_id = std::env::var("MAP_INSTANCE_ID").unwrap_or(args.instance_id);
    let port: u16 = env_override("MAP_PORT", args.port);
    let seed: u64 = env_override("MAP_SEED", args.seed);
    let orch_url = std::env::var("ORCH_URL").ok().or(args.orch_url);
    let tick_log = std::env::var("SERVER_TICK_LOG").is_ok_and(|v| v == "1" || v == "true");

    let orch = match orch_url {
        Some(url) => {
            let secret = std::env::var("ORCH_INTERNAL_RPC_SECRET").map_err(|_| {
                "ORCH_INTERNAL_RPC_SECRET must be set when an orchestrator URL is configured"
            })?;
            Some(OrchClient::new(url, secret))
        }
        None => {
            info!("No orchestrator configured; accepting direct auth-key joins");
            None
        }
    };

    let config = ServerConfig {
        instance_id: instance_id.clone(),
        bind_addr: format!("{}:{}", args.host, port),
        seed,
        max_clients: args.max_clients,
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        tick_log,
        orch,
    };

    info!("Starting map instance {instance_id} on port {port}");
    Server::new(config).run().await
}
