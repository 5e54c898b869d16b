//! Ticket and account persistence (SQLite).
//!
//! The consume-ticket path is the only shared resource between maps and
//! must be serializable: marking a ticket consumed and reading its
//! snapshot happen against a single-connection pool, and the consume
//! itself is a guarded `UPDATE ... WHERE consumed = 0` so a second
//! validation can never win the row.

use log::info;
use sha2::{Digest, Sha256};
use shared::PlayerSnapshot;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Why a ticket failed validation. Codes are part of the HTTP contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketError {
    NotFound,
    Expired,
    AlreadyConsumed,
    MapMismatch,
}

impl TicketError {
    pub fn as_code(&self) -> &'static str {
        match self {
            TicketError::NotFound => "ticket_not_found",
            TicketError::Expired => "ticket_expired",
            TicketError::AlreadyConsumed => "ticket_already_consumed",
            TicketError::MapMismatch => "map_instance_mismatch",
        }
    }
}

/// Successful validation: the bound account and its persisted snapshot.
#[derive(Debug, Clone)]
pub struct ValidatedTicket {
    pub account_id: String,
    pub snapshot: Option<PlayerSnapshot>,
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn hash_auth_key(auth_key: &str) -> String {
    let digest = Sha256::digest(auth_key.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) the database at `path`.
    pub async fn open(path: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
            .create_if_missing(true);
        Self::open_with(options).await
    }

    /// In-memory store for tests.
    pub async fn open_memory() -> Result<Self, sqlx::Error> {
        Self::open_with(SqliteConnectOptions::from_str("sqlite::memory:")?).await
    }

    async fn open_with(options: SqliteConnectOptions) -> Result<Self, sqlx::Error> {
        // One connection keeps :memory: coherent and serializes the
        // consume path.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tickets (
                ticket_id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                map_instance_id TEXT NOT NULL,
                issued_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0,
                snapshot_blob TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS accounts (
                account_id TEXT PRIMARY KEY,
                auth_key_hash TEXT NOT NULL UNIQUE,
                last_known_map_instance_id TEXT,
                snapshot_blob TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Looks up the account for an auth key, registering it on first
    /// use. Returns `(account_id, last_known_map_instance_id)`.
    pub async fn register_or_lookup_account(
        &self,
        auth_key: &str,
    ) -> Result<(String, Option<String>), sqlx::Error> {
        let hash = hash_auth_key(auth_key);
        if let Some(row) = sqlx::query(
            "SELECT account_id, last_known_map_instance_id FROM accounts WHERE auth_key_hash = ?",
        )
        .bind(&hash)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok((row.get("account_id"), row.get("last_known_map_instance_id")));
        }

        let account_id = format!("acct-{}", Uuid::new_v4());
        sqlx::query("INSERT INTO accounts (account_id, auth_key_hash) VALUES (?, ?)")
            .bind(&account_id)
            .bind(&hash)
            .execute(&self.pool)
            .await?;
        info!("Registered account {account_id}");
        Ok((account_id, None))
    }

    /// Issues a single-use ticket binding `account_id` to one map
    /// instance, carrying the account's persisted snapshot (if any).
    pub async fn issue_ticket(
        &self,
        account_id: &str,
        map_instance_id: &str,
        ttl_ms: i64,
        now_ms: i64,
    ) -> Result<String, sqlx::Error> {
        let snapshot_blob: Option<String> =
            sqlx::query("SELECT snapshot_blob FROM accounts WHERE account_id = ?")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?
                .and_then(|row| row.get("snapshot_blob"));

        let ticket_id = format!("jt-{}", Uuid::new_v4());
        sqlx::query(
            "INSERT INTO tickets
                (ticket_id, account_id, map_instance_id, issued_at_ms, expires_at_ms, consumed, snapshot_blob)
             VALUES (?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&ticket_id)
        .bind(account_id)
        .bind(map_instance_id)
        .bind(now_ms)
        .bind(now_ms + ttl_ms)
        .bind(snapshot_blob)
        .execute(&self.pool)
        .await?;
        Ok(ticket_id)
    }

    /// Validates and atomically consumes a ticket. Exactly one call per
    /// ticket can ever succeed.
    pub async fn validate_ticket(
        &self,
        ticket_id: &str,
        map_instance_id: &str,
        now_ms: i64,
    ) -> Result<Result<ValidatedTicket, TicketError>, sqlx::Error> {
        let Some(row) = sqlx::query(
            "SELECT account_id, map_instance_id, expires_at_ms, consumed, snapshot_blob
             FROM tickets WHERE ticket_id = ?",
        )
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(Err(TicketError::NotFound));
        };

        let consumed: i64 = row.get("consumed");
        if consumed != 0 {
            return Ok(Err(TicketError::AlreadyConsumed));
        }
        let expires_at: i64 = row.get("expires_at_ms");
        if now_ms > expires_at {
            return Ok(Err(TicketError::Expired));
        }
        let bound_map: String = row.get("map_instance_id");
        if bound_map != map_instance_id {
            return Ok(Err(TicketError::MapMismatch));
        }

        // The guarded update is the serialization point: losing the race
        // reads as already-consumed.
        let updated = sqlx::query("UPDATE tickets SET consumed = 1 WHERE ticket_id = ? AND consumed = 0")
            .bind(ticket_id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() != 1 {
            return Ok(Err(TicketError::AlreadyConsumed));
        }

        let account_id: String = row.get("account_id");
        let snapshot = row
            .get::<Option<String>, _>("snapshot_blob")
            .and_then(|blob| serde_json::from_str(&blob).ok());

        Ok(Ok(ValidatedTicket {
            account_id,
            snapshot,
        }))
    }

    /// Persists the latest snapshot for an account (transfer path).
    pub async fn save_snapshot(
        &self,
        account_id: &str,
        snapshot: &PlayerSnapshot,
        last_map: &str,
    ) -> Result<(), sqlx::Error> {
        let blob = serde_json::to_string(snapshot).unwrap_or_default();
        sqlx::query(
            "UPDATE accounts SET snapshot_blob = ?, last_known_map_instance_id = ? WHERE account_id = ?",
        )
        .bind(&blob)
        .bind(last_map)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::open_memory().await.unwrap()
    }

    fn snapshot(x: f32, health: i32) -> PlayerSnapshot {
        let mut s = PlayerSnapshot::fresh();
        s.x = x;
        s.z = -x;
        s.health = health;
        s
    }

    #[tokio::test]
    async fn test_account_auto_registration_is_stable() {
        let store = store().await;
        let (a, _) = store.register_or_lookup_account("key-1").await.unwrap();
        let (b, _) = store.register_or_lookup_account("key-1").await.unwrap();
        let (c, _) = store.register_or_lookup_account("key-2").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_ticket_validates_once() {
        let store = store().await;
        let now = 1_000_000;
        let ticket = store.issue_ticket("acct-1", "map-a", 5_000, now).await.unwrap();

        let first = store.validate_ticket(&ticket, "map-a", now + 10).await.unwrap();
        assert_eq!(first.unwrap().account_id, "acct-1");

        let second = store.validate_ticket(&ticket, "map-a", now + 20).await.unwrap();
        assert_eq!(second.unwrap_err(), TicketError::AlreadyConsumed);
    }

    #[tokio::test]
    async fn test_ticket_expiry() {
        let store = store().await;
        let now = 1_000_000;
        let ticket = store.issue_ticket("acct-1", "map-a", 250, now).await.unwrap();

        let late = store.validate_ticket(&ticket, "map-a", now + 251).await.unwrap();
        assert_eq!(late.unwrap_err(), TicketError::Expired);
    }

    #[tokio::test]
    async fn test_ticket_map_mismatch() {
        let store = store().await;
        let now = 1_000_000;
        let ticket = store.issue_ticket("acct-1", "map-a", 5_000, now).await.unwrap();

        let wrong = store.validate_ticket(&ticket, "map-b", now + 10).await.unwrap();
        assert_eq!(wrong.unwrap_err(), TicketError::MapMismatch);
        // The mismatch did not consume it.
        let right = store.validate_ticket(&ticket, "map-a", now + 20).await.unwrap();
        assert!(right.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_ticket() {
        let store = store().await;
        let missing = store.validate_ticket("jt-nope", "map-a", 0).await.unwrap();
        assert_eq!(missing.unwrap_err(), TicketError::NotFound);
    }

    #[tokio::test]
    async fn test_snapshot_travels_with_ticket() {
        let store = store().await;
        let (account, _) = store.register_or_lookup_account("key").await.unwrap();
        store
            .save_snapshot(&account, &snapshot(12.5, 40), "map-a")
            .await
            .unwrap();

        let now = 1_000_000;
        let ticket = store.issue_ticket(&account, "map-b", 5_000, now).await.unwrap();
        let validated = store
            .validate_ticket(&ticket, "map-b", now + 10)
            .await
            .unwrap()
            .unwrap();
        let restored = validated.snapshot.expect("snapshot restored");
        assert!((restored.x - 12.5).abs() < 1e-6);
        assert_eq!(restored.health, 40);
    }

    #[tokio::test]
    async fn test_persistence_survives_reopen() {
        let path = std::env::temp_dir().join(format!("orch-test-{}.db", Uuid::new_v4()));
        let path_str = path.to_str().unwrap().to_string();
        let now = 1_000_000;

        let ticket = {
            let store = Store::open(&path_str).await.unwrap();
            let (account, _) = store.register_or_lookup_account("key").await.unwrap();
            store
                .save_snapshot(&account, &snapshot(7.25, 64), "map-a")
                .await
                .unwrap();
            store.issue_ticket(&account, "map-b", 60_000, now).await.unwrap()
        };

        // Fresh pool over the same file: the restart boundary.
        let store = Store::open(&path_str).await.unwrap();
        let validated = store
            .validate_ticket(&ticket, "map-b", now + 10)
            .await
            .unwrap()
            .unwrap();
        let restored = validated.snapshot.expect("snapshot survived restart");
        assert!((restored.x - 7.25).abs() < 1e-6);
        assert!((restored.z + 7.25).abs() < 1e-6);
        assert_eq!(restored.health, 64);

        // And consumption state survives too.
        let again = store.validate_ticket(&ticket, "map-b", now + 20).await.unwrap();
        assert_eq!(again.unwrap_err(), TicketError::AlreadyConsumed);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_last_known_map_updates() {
        let store = store().await;
        let (account, last) = store.register_or_lookup_account("key").await.unwrap();
        assert_eq!(last, None);
        store
            .save_snapshot(&account, &snapshot(0.0, 100), "map-b")
            .await
            .unwrap();
        let (_, last) = store.register_or_lookup_account("key").await.unwrap();
        assert_eq!(last.as_deref(), Some("map-b"));
    }
}
