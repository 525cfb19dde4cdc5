//! SQLite-backed persistent store.
//!
//! One connection behind an async mutex; every operation is a short
//! transaction and the connection is never held across automation calls.
//! The task-claim protocol lives in [`accounts`]; combined with SQLite's
//! single-writer IMMEDIATE transactions it guarantees an account is never
//! handed to two workers at once.

mod accounts;
mod devices;
mod events;
mod niches;
mod warming;

pub use accounts::NewAccount;
pub use events::{EventFilter, NewEvent};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{AccountState, EventCategory, EventSeverity, Platform};

/// Retry budget for transient store contention.
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("illegal account state transition: {from} -> {to}")]
    IllegalTransition {
        from: AccountState,
        to: AccountState,
    },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS niches (
    id TEXT PRIMARY KEY NOT NULL,
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    tier INTEGER NOT NULL DEFAULT 2,
    status TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    udid TEXT NOT NULL UNIQUE,
    automation_port INTEGER NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'active',
    connected_since TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY NOT NULL,
    platform TEXT NOT NULL,
    username TEXT NOT NULL,
    email_enc TEXT,
    password_enc TEXT,
    totp_secret_enc TEXT,
    proxy_credentials TEXT,
    niche_id TEXT REFERENCES niches(id),
    device_id TEXT REFERENCES devices(id),
    current_state TEXT NOT NULL DEFAULT 'created',
    warming_day_count INTEGER NOT NULL DEFAULT 0 CHECK (warming_day_count >= 0),
    followers INTEGER NOT NULL DEFAULT 0,
    following INTEGER NOT NULL DEFAULT 0,
    bio TEXT,
    last_activity_at TEXT,
    last_warmed_at TEXT,
    last_post_at TEXT,
    claimed_at TEXT,
    deleted_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(platform, username)
);

CREATE INDEX IF NOT EXISTS idx_accounts_claim
    ON accounts(last_warmed_at ASC)
    WHERE deleted_at IS NULL
      AND platform IN ('tiktok', 'instagram')
      AND current_state IN ('created', 'warming_p1', 'warming_p2', 'warming_p3', 'active');
CREATE INDEX IF NOT EXISTS idx_accounts_niche ON accounts(niche_id, platform);
CREATE INDEX IF NOT EXISTS idx_accounts_state ON accounts(current_state);

CREATE TABLE IF NOT EXISTS system_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    category TEXT NOT NULL,
    severity TEXT NOT NULL,
    event_type TEXT NOT NULL,
    device_id TEXT,
    account_id TEXT,
    message TEXT NOT NULL,
    context TEXT NOT NULL DEFAULT '{}',
    resolved INTEGER NOT NULL DEFAULT 0,
    resolved_by TEXT,
    resolved_at TEXT,
    CHECK ((resolved = 0 AND resolved_at IS NULL) OR (resolved = 1 AND resolved_at IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_events_severity ON system_events(severity, id);
CREATE INDEX IF NOT EXISTS idx_events_category ON system_events(category, id);
CREATE INDEX IF NOT EXISTS idx_events_type ON system_events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_unresolved ON system_events(resolved, id);

CREATE TABLE IF NOT EXISTS warming_progress (
    id TEXT PRIMARY KEY NOT NULL,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    device_id TEXT NOT NULL,
    platform TEXT NOT NULL,
    warming_phase INTEGER NOT NULL,
    warming_day INTEGER NOT NULL,
    session_data TEXT NOT NULL DEFAULT '{}',
    started_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_warming_account ON warming_progress(account_id, started_at DESC);
"#;

/// Handle to the persistent store. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at the given path and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection, retrying transient busy/locked
    /// failures up to 3 times with jitter before surfacing the error.
    pub(crate) async fn with_conn<T>(
        &self,
        mut f: impl FnMut(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0;
        loop {
            let result = {
                let mut conn = self.conn.lock().await;
                f(&mut conn)
            };
            match result {
                Err(e) if e.is_transient() && attempt + 1 < MAX_RETRIES => {
                    attempt += 1;
                    let jitter_ms = 50 + (rand::random::<u64>() % 200) * attempt as u64;
                    tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
                }
                other => return other,
            }
        }
    }
}

// ── Row codec helpers ────────────────────────────────────────────────────────

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {:?}: {}", raw, e)))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| parse_ts(&s)).transpose()
}

/// Parse a UUID from a database string, logging a warning and falling back
/// to the nil UUID when the value is malformed, so one corrupt row cannot
/// poison a whole query.
pub(crate) fn parse_uuid_or_nil(raw: &str) -> Uuid {
    Uuid::parse_str(raw).unwrap_or_else(|e| {
        tracing::warn!(raw_value = %raw, error = %e, "Corrupt UUID in database; substituting nil UUID");
        Uuid::nil()
    })
}

pub(crate) fn parse_platform(raw: &str) -> Result<Platform, StoreError> {
    Platform::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("platform {:?}", raw)))
}

pub(crate) fn parse_state(raw: &str) -> Result<AccountState, StoreError> {
    AccountState::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("account state {:?}", raw)))
}

pub(crate) fn parse_category(raw: &str) -> Result<EventCategory, StoreError> {
    EventCategory::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("category {:?}", raw)))
}

pub(crate) fn parse_severity(raw: &str) -> Result<EventSeverity, StoreError> {
    EventSeverity::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("severity {:?}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sovi.db");
        {
            let store = Store::open(&path).unwrap();
            store.insert_niche("fitness", "Fitness", 2).await.unwrap();
        }
        let store = Store::open(&path).unwrap();
        let niches = store.list_active_niches().await.unwrap();
        assert_eq!(niches.len(), 1);
        assert_eq!(niches[0].slug, "fitness");
    }

    #[test]
    fn timestamps_round_trip() {
        let now = Utc::now();
        let parsed = parse_ts(&ts(now)).unwrap();
        assert_eq!(parsed, now);
    }

    #[test]
    fn corrupt_uuid_degrades_to_nil() {
        assert_eq!(parse_uuid_or_nil("not-a-uuid"), Uuid::nil());
    }
}
