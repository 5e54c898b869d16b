//! Join-ticket validation and transfer RPCs against the orchestrator.

use log::{debug, warn};
use serde::Deserialize;
use shared::protocol::{JoinRefusal, MapConfig};
use shared::PlayerSnapshot;

/// Header carrying the shared secret on internal RPCs.
pub const ORCH_SECRET_HEADER: &str = "x-orch-secret";

/// Identity established by a successful ticket validation.
#[derive(Debug, Clone)]
pub struct ValidatedJoin {
    pub account_id: String,
    pub snapshot: Option<PlayerSnapshot>,
}

/// A fresh single-use ticket for a destination map.
#[derive(Debug, Clone)]
pub struct TransferGrant {
    pub ws_url: String,
    pub join_ticket: String,
    pub map_config: MapConfig,
}

#[derive(Deserialize)]
struct ValidateResponse {
    ok: bool,
    error: Option<String>,
    #[serde(rename = "accountId")]
    account_id: Option<String>,
    #[serde(rename = "playerSnapshot")]
    player_snapshot: Option<PlayerSnapshot>,
}

#[derive(Deserialize)]
struct TransferResponse {
    ok: bool,
    #[serde(rename = "joinTicket")]
    join_ticket: Option<String>,
    #[serde(rename = "wsUrl")]
    ws_url: Option<String>,
    #[serde(rename = "mapConfig")]
    map_config: Option<MapConfig>,
}

/// HTTP client for the orchestrator's internal API.
#[derive(Clone)]
pub struct OrchClient {
    base_url: String,
    secret: String,
    http: reqwest::Client,
}

impl OrchClient {
    pub fn new(base_url: String, secret: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
            http: reqwest::Client::new(),
        }
    }

    fn refusal_from_code(code: &str) -> JoinRefusal {
        match code {
            "ticket_expired" => JoinRefusal::TicketExpired,
            "ticket_already_consumed" => JoinRefusal::TicketAlreadyConsumed,
            "map_instance_mismatch" => JoinRefusal::MapInstanceMismatch,
            _ => JoinRefusal::TicketNotFound,
        }
    }

    /// Atomically consumes a join ticket; the orchestrator guarantees a
    /// second call for the same ticket fails.
    pub async fn validate_join_ticket(
        &self,
        join_ticket: &str,
        map_instance_id: &str,
    ) -> Result<ValidatedJoin, JoinRefusal> {
        let url = format!("{}/orch/validate-join-ticket", self.base_url);
        let body = serde_json::json!({
            "joinTicket": join_ticket,
            "mapInstanceId": map_instance_id,
        });

        let response = self
            .http
            .post(&url)
            .header(ORCH_SECRET_HEADER, &self.secret)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!("validate-join-ticket transport failure: {e}");
                JoinRefusal::TicketNotFound
            })?;

        let parsed: ValidateResponse = response.json().await.map_err(|e| {
            warn!("validate-join-ticket malformed response: {e}");
            JoinRefusal::TicketNotFound
        })?;

        if parsed.ok {
            match parsed.account_id {
                Some(account_id) => {
                    debug!("Ticket validated for account {account_id}");
                    Ok(ValidatedJoin {
                        account_id,
                        snapshot: parsed.player_snapshot,
                    })
                }
                None => Err(JoinRefusal::TicketNotFound),
            }
        } else {
            Err(Self::refusal_from_code(parsed.error.as_deref().unwrap_or("")))
        }
    }

    /// Persists a snapshot and obtains a fresh ticket for the target map.
    pub async fn request_transfer(
        &self,
        account_id: &str,
        from_map: &str,
        to_map: &str,
        snapshot: &PlayerSnapshot,
    ) -> Result<TransferGrant, Box<dyn std::error::Error + Send + Sync>> {
        let url = format!("{}/orch/request-transfer", self.base_url);
        let body = serde_json::json!({
            "accountId": account_id,
            "fromMapInstanceId": from_map,
            "toMapInstanceId": to_map,
            "playerSnapshot": snapshot,
        });

        let parsed: TransferResponse = self
            .http
            .post(&url)
            .header(ORCH_SECRET_HEADER, &self.secret)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        match (parsed.ok, parsed.join_ticket, parsed.ws_url, parsed.map_config) {
            (true, Some(join_ticket), Some(ws_url), Some(map_config)) => Ok(TransferGrant {
                ws_url,
                join_ticket,
                map_config,
            }),
            _ => Err("transfer refused by orchestrator".into()),
        }
    }
}
