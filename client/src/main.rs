//! Headless client binary: connects (via orchestrator bootstrap or
//! directly to a map), walks forward for a scripted duration and logs
//! the observed state. Rendering is an external consumer; this binary
//! exists for soak testing and operations checks.

use clap::Parser;
use client::network::NetSimConfig;
use client::runtime::{ClientRuntime, ConnectionMode};
use log::info;
use shared::protocol::MapConfig;
use shared::MoveInput;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Shardworld headless client")]
struct Args {
    /// Orchestrator base URL for bootstrap (e.g. http://127.0.0.1:8080)
    #[clap(long)]
    orch_url: Option<String>,

    /// Direct map WebSocket URL (standalone mode)
    #[clap(long)]
    ws_url: Option<String>,

    /// Map seed when connecting directly
    #[clap(long, default_value = "1")]
    seed: u64,

    /// Auth key identifying this account
    #[clap(long, default_value = "dev-key")]
    auth_key: String,

    /// Seconds to walk forward before exiting
    #[clap(long, default_value = "10")]
    walk_secs: u64,

    /// Simulated ack drop rate (0..1)
    #[clap(long, default_value = "0.0")]
    ack_drop_rate: f64,

    /// Simulated ack delay in milliseconds
    #[clap(long, default_value = "0")]
    ack_delay_ms: u64,

    /// Simulated ack jitter in milliseconds
    #[clap(long, default_value = "0")]
    ack_jitter_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let args = Args::parse();

    let netsim = NetSimConfig {
        ack_drop_rate: args.ack_drop_rate,
        ack_delay_ms: args.ack_delay_ms,
        ack_jitter_ms: args.ack_jitter_ms,
    };

    let mut runtime = match (&args.orch_url, &args.ws_url) {
        (Some(orch), _) => ClientRuntime::connect_bootstrap(orch, &args.auth_key, netsim).await?,
        (None, Some(ws)) => {
            let map_config = MapConfig {
                instance_id: "standalone".into(),
                seed: args.seed,
            };
            ClientRuntime::connect_direct(ws, &args.auth_key, map_config, netsim).await?
        }
        (None, None) => return Err("pass --orch-url or --ws-url".into()),
    };

    runtime.set_test_movement(MoveInput {
        forward: 1.0,
        ..Default::default()
    });

    let deadline = Instant::now() + Duration::from_secs(args.walk_secs);
    let mut last_frame = Instant::now();
    let mut last_report = Instant::now();

    while Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(16)).await;
        let now = Instant::now();
        runtime.advance_time(now.duration_since(last_frame).as_secs_f64() * 1000.0);
        last_frame = now;

        // A transfer grant means reconnecting to the destination map.
        if let Some(transfer) = runtime.take_pending_transfer() {
            info!("Transferring to {}", transfer.map_config.instance_id);
            runtime = ClientRuntime::connect_with_ticket(
                &transfer.ws_url,
                &transfer.join_ticket,
                transfer.map_config,
                netsim,
            )
            .await?;
            runtime.set_test_movement(MoveInput {
                forward: 1.0,
                ..Default::default()
            });
        }

        if now.duration_since(last_report) >= Duration::from_secs(1) {
            last_report = now;
            let state = runtime.render_game_state();
            if let Some(local) = state.local {
                info!(
                    "mode {:?} nid {:?} pos ({:.2}, {:.2}, {:.2}) remotes {}",
                    state.mode,
                    state.nid,
                    local.position[0],
                    local.position[1],
                    local.position[2],
                    state.remotes.len()
                );
            }
        }
    }

    if runtime.mode() == ConnectionMode::Connected {
        runtime.send(shared::protocol::Message::Disconnect);
    }
    Ok(())
}
