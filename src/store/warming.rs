//! Append-only warming session records.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use super::{parse_opt_ts, parse_platform, parse_ts, parse_uuid_or_nil, ts, Store, StoreError};
use crate::model::WarmingSession;

fn session_from_row(row: &rusqlite::Row<'_>) -> Result<WarmingSession, StoreError> {
    let id: String = row.get(0)?;
    let account_id: String = row.get(1)?;
    let device_id: String = row.get(2)?;
    let platform: String = row.get(3)?;
    let session_data: String = row.get(6)?;
    let started_at: String = row.get(7)?;
    let completed_at: Option<String> = row.get(8)?;

    Ok(WarmingSession {
        id: parse_uuid_or_nil(&id),
        account_id: parse_uuid_or_nil(&account_id),
        device_id: parse_uuid_or_nil(&device_id),
        platform: parse_platform(&platform)?,
        warming_phase: row.get(4)?,
        warming_day: row.get(5)?,
        session_data: serde_json::from_str(&session_data).unwrap_or_else(|_| serde_json::json!({})),
        started_at: parse_ts(&started_at)?,
        completed_at: parse_opt_ts(completed_at)?,
    })
}

impl Store {
    /// Insert one warming record. Records are never mutated afterwards.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_warming_session(
        &self,
        account_id: Uuid,
        device_id: Uuid,
        platform: crate::model::Platform,
        warming_phase: i64,
        warming_day: i64,
        session_data: serde_json::Value,
        started_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO warming_progress \
                 (id, account_id, device_id, platform, warming_phase, warming_day, session_data, \
                  started_at, completed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.to_string(),
                    account_id.to_string(),
                    device_id.to_string(),
                    platform.as_str(),
                    warming_phase,
                    warming_day,
                    session_data.to_string(),
                    ts(started_at),
                    completed_at.map(ts),
                ],
            )?;
            Ok(id)
        })
        .await
    }

    pub async fn warming_sessions_for_account(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<WarmingSession>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, account_id, device_id, platform, warming_phase, warming_day, \
                 session_data, started_at, completed_at FROM warming_progress \
                 WHERE account_id = ?1 ORDER BY started_at DESC",
            )?;
            let rows = stmt.query_map(params![account_id.to_string()], |row| {
                Ok(session_from_row(row))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Platform;
    use crate::store::Store;

    #[tokio::test]
    async fn records_append_and_read_back() {
        let store = Store::open_in_memory().unwrap();
        let niche = store.insert_niche("fitness", "Fitness", 2).await.unwrap();
        let account = store
            .insert_account(crate::store::NewAccount {
                platform: Platform::Tiktok,
                username: "fit_warm".into(),
                email_enc: "e".into(),
                password_enc: "p".into(),
                totp_secret_enc: "t".into(),
                proxy_credentials: None,
                niche_id: niche.id,
                device_id: None,
            })
            .await
            .unwrap();
        let device = Uuid::new_v4();

        let started = Utc::now();
        store
            .insert_warming_session(
                account.id,
                device,
                Platform::Tiktok,
                1,
                1,
                serde_json::json!({"videos_watched": 42, "likes": 0, "follows": 0}),
                started,
                Some(Utc::now()),
            )
            .await
            .unwrap();

        let sessions = store.warming_sessions_for_account(account.id).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].warming_phase, 1);
        assert_eq!(sessions[0].session_data["videos_watched"], 42);
        assert!(sessions[0].completed_at.is_some());
    }
}
