//! Orchestrator HTTP API.
//!
//! - `POST /bootstrap` — public; auth key in, ticket + map endpoint out.
//! - `POST /orch/validate-join-ticket` — internal; requires the shared
//!   secret header; atomically consumes a ticket.
//! - `POST /orch/request-transfer` — internal; persists a snapshot and
//!   issues a fresh ticket for the destination map.
//! - `GET /health` — per-map `{instanceId, pid, ready}`.
//! - `POST /orch/debug/crash-map` — feature-flagged debug kill switch.

use crate::store::{now_ms, Store};
use crate::supervisor::Supervisor;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::protocol::MapConfig;
use shared::PlayerSnapshot;
use std::sync::Arc;

/// Header carrying the internal RPC secret.
pub const ORCH_SECRET_HEADER: &str = "x-orch-secret";

pub struct AppState {
    pub store: Store,
    pub supervisor: Arc<Supervisor>,
    pub secret: String,
    pub ticket_ttl_ms: i64,
    pub debug_endpoints: bool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/bootstrap", post(bootstrap))
        .route("/orch/validate-join-ticket", post(validate_join_ticket))
        .route("/orch/request-transfer", post(request_transfer))
        .route("/health", get(health))
        .route("/orch/debug/crash-map", post(crash_map))
        .with_state(state)
}

fn secret_ok(state: &AppState, headers: &HeaderMap) -> bool {
    headers
        .get(ORCH_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == state.secret)
}

fn map_config_for(state: &AppState, instance_id: &str) -> Option<MapConfig> {
    state.supervisor.spec(instance_id).map(|spec| MapConfig {
        instance_id: spec.instance_id.clone(),
        seed: spec.seed,
    })
}

#[derive(Deserialize)]
struct BootstrapRequest {
    #[serde(rename = "authKey")]
    auth_key: String,
}

async fn bootstrap(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BootstrapRequest>,
) -> (StatusCode, Json<Value>) {
    let (account_id, last_map) = match state.store.register_or_lookup_account(&request.auth_key).await {
        Ok(found) => found,
        Err(e) => {
            warn!("bootstrap: account lookup failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": "storage_failure" })),
            );
        }
    };

    // Send the player back to their last map when it is still hosted.
    let instance_id = last_map
        .filter(|m| state.supervisor.spec(m).is_some())
        .unwrap_or_else(|| {
            state
                .supervisor
                .specs()
                .first()
                .map(|s| s.instance_id.clone())
                .unwrap_or_default()
        });

    let Some(map_config) = map_config_for(&state, &instance_id) else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "error": "no_maps" })),
        );
    };
    let Some(ws_url) = state.supervisor.ws_url_for(&instance_id) else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "error": "no_maps" })),
        );
    };

    match state
        .store
        .issue_ticket(&account_id, &instance_id, state.ticket_ttl_ms, now_ms())
        .await
    {
        Ok(ticket) => {
            info!("Bootstrap: {account_id} → {instance_id}");
            (
                StatusCode::OK,
                Json(json!({
                    "ok": true,
                    "wsUrl": ws_url,
                    "joinTicket": ticket,
                    "mapConfig": map_config,
                })),
            )
        }
        Err(e) => {
            warn!("bootstrap: ticket issue failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": "storage_failure" })),
            )
        }
    }
}

#[derive(Deserialize)]
struct ValidateRequest {
    #[serde(rename = "joinTicket")]
    join_ticket: String,
    #[serde(rename = "mapInstanceId")]
    map_instance_id: String,
}

async fn validate_join_ticket(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ValidateRequest>,
) -> (StatusCode, Json<Value>) {
    if !secret_ok(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error": "bad_secret" })),
        );
    }

    match state
        .store
        .validate_ticket(&request.join_ticket, &request.map_instance_id, now_ms())
        .await
    {
        Ok(Ok(validated)) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "accountId": validated.account_id,
                "playerSnapshot": validated.snapshot,
            })),
        ),
        Ok(Err(refusal)) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error": refusal.as_code() })),
        ),
        Err(e) => {
            warn!("validate-join-ticket: storage failure: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": "storage_failure" })),
            )
        }
    }
}

#[derive(Deserialize)]
struct TransferRequest {
    #[serde(rename = "accountId")]
    account_id: String,
    #[serde(rename = "fromMapInstanceId")]
    from_map_instance_id: String,
    #[serde(rename = "toMapInstanceId")]
    to_map_instance_id: String,
    #[serde(rename = "playerSnapshot")]
    player_snapshot: PlayerSnapshot,
}

async fn request_transfer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<TransferRequest>,
) -> (StatusCode, Json<Value>) {
    if !secret_ok(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error": "bad_secret" })),
        );
    }

    let Some(map_config) = map_config_for(&state, &request.to_map_instance_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "error": "unknown_map_instance" })),
        );
    };
    let ws_url = state
        .supervisor
        .ws_url_for(&request.to_map_instance_id)
        .unwrap_or_default();

    if let Err(e) = state
        .store
        .save_snapshot(
            &request.account_id,
            &request.player_snapshot,
            &request.to_map_instance_id,
        )
        .await
    {
        warn!("request-transfer: snapshot save failed: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "ok": false, "error": "storage_failure" })),
        );
    }

    match state
        .store
        .issue_ticket(
            &request.account_id,
            &request.to_map_instance_id,
            state.ticket_ttl_ms,
            now_ms(),
        )
        .await
    {
        Ok(ticket) => {
            info!(
                "Transfer: {} {} → {}",
                request.account_id, request.from_map_instance_id, request.to_map_instance_id
            );
            (
                StatusCode::OK,
                Json(json!({
                    "ok": true,
                    "joinTicket": ticket,
                    "wsUrl": ws_url,
                    "mapConfig": map_config,
                })),
            )
        }
        Err(e) => {
            warn!("request-transfer: ticket issue failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": "storage_failure" })),
            )
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let maps: Vec<Value> = state
        .supervisor
        .statuses()
        .await
        .into_iter()
        .map(|s| {
            json!({
                "instanceId": s.instance_id,
                "pid": s.pid,
                "ready": s.ready,
            })
        })
        .collect();
    Json(json!({ "maps": maps }))
}

#[derive(Deserialize)]
struct CrashRequest {
    #[serde(rename = "instanceId")]
    instance_id: String,
}

async fn crash_map(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CrashRequest>,
) -> (StatusCode, Json<Value>) {
    if !state.debug_endpoints {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "error": "disabled" })),
        );
    }
    let killed = state.supervisor.crash(&request.instance_id).await;
    (
        if killed { StatusCode::OK } else { StatusCode::NOT_FOUND },
        Json(json!({ "ok": killed })),
    )
}
